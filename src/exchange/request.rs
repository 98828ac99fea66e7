use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::content::{self, ContentError};

/// Authenticated caller attached by the security stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    account: Option<Account>,
    resource_path: Option<String>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            account: None,
            resource_path: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path relative to the mount the request was routed to.
    pub fn resource_path(&self) -> &str {
        self.resource_path.as_deref().unwrap_or_else(|| self.path())
    }

    pub fn set_resource_path(&mut self, path: impl Into<String>) {
        self.resource_path = Some(path.into());
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_options(&self) -> bool {
        self.method == Method::OPTIONS
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn set_account(&mut self, account: Option<Account>) {
        self.account = account;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn text(&self) -> Result<&str, ContentError> {
        content::as_text(&self.body)
    }

    pub fn json(&self) -> Result<Option<Value>, ContentError> {
        content::as_json(&self.body)
    }

    pub fn document(&self) -> Result<Option<serde_json::Map<String, Value>>, ContentError> {
        content::as_document(&self.body)
    }

    pub fn csv(&self) -> Result<Vec<Vec<String>>, ContentError> {
        content::as_csv(&self.body)
    }

    pub fn set_json(&mut self, value: &Value) -> Result<(), ContentError> {
        self.body = content::json_bytes(value)?;
        Ok(())
    }
}
