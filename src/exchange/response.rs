use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use std::sync::Arc;

use super::content::{self, ContentError};
use crate::buffer::{BufferPool, BufferedContent};

#[derive(Debug, Clone)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    content: BufferedContent,
    in_error: bool,
    error_message: Option<String>,
}

impl Response {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            content: BufferedContent::new(pool),
            in_error: false,
            error_message: None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn status_or_ok(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_content_type(&mut self, value: &'static str) {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
    }

    pub fn content(&self) -> &BufferedContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut BufferedContent {
        &mut self.content
    }

    pub fn body(&self) -> Bytes {
        self.content.to_bytes()
    }

    pub fn set_body(&mut self, body: &[u8]) -> Result<(), ContentError> {
        self.content.replace(body)?;
        Ok(())
    }

    pub fn text(&self) -> Result<String, ContentError> {
        content::as_text(&self.body()).map(str::to_owned)
    }

    pub fn json(&self) -> Result<Option<Value>, ContentError> {
        content::as_json(&self.body())
    }

    pub fn document(&self) -> Result<Option<serde_json::Map<String, Value>>, ContentError> {
        content::as_document(&self.body())
    }

    pub fn csv(&self) -> Result<Vec<Vec<String>>, ContentError> {
        content::as_csv(&self.body())
    }

    pub fn set_json(&mut self, value: &Value) -> Result<(), ContentError> {
        let bytes = content::json_bytes(value)?;
        self.set_body(&bytes)?;
        self.set_content_type("application/json");
        Ok(())
    }

    /// Mark the response as failed. The exchange picks this up after the
    /// current interceptor or service returns.
    pub fn set_in_error(&mut self, status: StatusCode, message: impl Into<String>) {
        self.status = Some(status);
        self.in_error = true;
        self.error_message = Some(message.into());
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}
