use crate::config::CorsConfig;
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue};

const EXPOSED_HEADERS: &str = "Location, ETag, X-Request-Id";

/// Add the CORS headers configured in `cors`. A preflight also gets the
/// allowed methods and headers.
pub fn add_cors_headers(headers: &mut HeaderMap, cors: &CorsConfig, preflight: bool) {
    if !cors.enabled {
        return;
    }

    insert(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &cors.allow_origin);
    insert(headers, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    insert(headers, header::ACCESS_CONTROL_EXPOSE_HEADERS, EXPOSED_HEADERS);

    if preflight {
        insert(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &cors.allow_methods);
        insert(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &cors.allow_headers);
        insert(headers, header::ACCESS_CONTROL_MAX_AGE, "86400");
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
