use super::{Service, ServiceError};
use crate::exchange::{Request, Response};
use async_trait::async_trait;
use http::{Method, StatusCode};
use serde_json::json;

/// Liveness endpoint. Echoes an optional `msg` query parameter.
pub struct PingService {
    message: String,
}

impl PingService {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for PingService {
    fn default() -> Self {
        Self::new("Greetings from restpipe!")
    }
}

#[async_trait]
impl Service for PingService {
    async fn handle(&self, request: &Request, response: &mut Response) -> Result<(), ServiceError> {
        match *request.method() {
            Method::GET | Method::HEAD => {
                let body = match request.query_param("msg") {
                    Some(echo) => json!({ "message": self.message, "echo": echo }),
                    None => json!({ "message": self.message }),
                };
                response.set_status(StatusCode::OK);
                response.set_json(&body)?;
                Ok(())
            }
            Method::OPTIONS => {
                response.set_status(StatusCode::OK);
                Ok(())
            }
            _ => {
                response.set_in_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
                Ok(())
            }
        }
    }
}
