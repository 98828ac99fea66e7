use super::cors::add_cors_headers;
use super::sender::send_response;
use crate::config::CorsConfig;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// JSON body used for every error the gateway answers itself.
pub(crate) fn error_body(status: StatusCode, message: &str) -> Value {
    json!({
        "http status code": status.as_u16(),
        "http status description": status.canonical_reason().unwrap_or("Unknown"),
        "message": message,
    })
}

/// Terminal stage for errors escaping the handler chain.
///
/// Writes a JSON error response unless the response already started, in
/// which case the error can only be logged.
#[derive(Debug, Clone, Default)]
pub struct ErrorReporter {
    cors: Option<CorsConfig>,
}

impl ErrorReporter {
    pub fn new(cors: CorsConfig) -> Self {
        Self { cors: Some(cors) }
    }

    pub async fn report(&self, exchange: &Arc<Exchange>, err: PipelineError) {
        // Errors raised inside a conduit arrive wrapped in io::Error
        let err = match &err {
            PipelineError::Io(io) => PipelineError::from_io(io).unwrap_or(&err),
            other => other,
        };

        let path = exchange.request().await.path().to_string();

        if exchange.is_response_started() {
            error!(path = %path, error = %err, "Error after the response started");
            let _ = exchange.end_exchange().await;
            return;
        }

        let status = err.status();
        let message = match err.missing_dependency() {
            Some((plugin, reason)) => {
                error!(plugin = %plugin, reason = %reason, path = %path, "Plugin is missing a dependency");
                exchange.set_in_error();
                format!("Error executing plugin {plugin}: missing dependency")
            }
            None if err.is_client_error() => {
                debug!(path = %path, status = status.as_u16(), error = %err, "Malformed request");
                err.to_string()
            }
            None => {
                error!(path = %path, error = %err, "Error handling the request");
                exchange.set_in_error();
                err.to_string()
            }
        };

        let is_options = exchange.request().await.is_options();
        {
            let mut response = exchange.response_mut().await;
            response.set_in_error(status, message.clone());
            if let Err(e) = response.set_json(&error_body(status, &message)) {
                warn!(error = %e, "Could not write the error body");
            }
            if let Some(cors) = &self.cors {
                add_cors_headers(response.headers_mut(), cors, is_options);
            }
        }

        if let Err(e) = send_response(exchange).await {
            warn!(path = %path, error = %e, "Could not send the error response");
        }
    }
}
