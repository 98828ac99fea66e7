//! Script plugin wire schema
//!
//! The gateway and a plugin's host process exchange one JSON object per
//! line. Each [`ScriptCall`] gets exactly one [`ScriptReply`].

use super::PluginError;
use crate::exchange::{Account, ContentKind, Request, Response};
use crate::interceptor::InterceptPoint;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a script plugin contributes to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    #[default]
    Interceptor,
    Service,
}

/// Options exported by a plugin module as `options`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOptions {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub kind: ScriptKind,

    #[serde(default = "default_intercept_point")]
    pub intercept_point: InterceptPoint,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub requires_content: bool,

    #[serde(default)]
    pub required: bool,

    /// Mount point for services; defaults to `/<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default)]
    pub content_kind: ContentKind,

    #[serde(default)]
    pub blocking: bool,
}

fn default_intercept_point() -> InterceptPoint {
    InterceptPoint::RequestAfterAuth
}

impl ScriptOptions {
    /// Validate options according to schema rules
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.name.trim().is_empty() {
            return Err(PluginError::config("options.name cannot be empty"));
        }

        if self.name.contains(char::is_whitespace) {
            return Err(PluginError::config(format!(
                "options.name '{}' cannot contain whitespace",
                self.name
            )));
        }

        if self.kind == ScriptKind::Interceptor && self.intercept_point == InterceptPoint::Any {
            return Err(PluginError::config(
                "options.interceptPoint ANY is only valid in a service's dontIntercept list",
            ));
        }

        if let Some(uri) = &self.uri {
            if !uri.starts_with('/') {
                return Err(PluginError::config(format!(
                    "options.uri '{uri}' must start with '/'"
                )));
            }
        }

        Ok(())
    }

    pub fn service_uri(&self) -> String {
        self.uri
            .clone()
            .unwrap_or_else(|| format!("/{}", self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOp {
    Options,
    Resolve,
    Handle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAccount {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Request as seen by a script plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<WireAccount>,
}

/// Response as seen by a script plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub in_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One message from the gateway to a plugin process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCall {
    pub op: ScriptOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<WireRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WireResponse>,
}

/// One message from a plugin process to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ScriptOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<WireRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WireResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScriptCall {
    pub fn options() -> Self {
        Self {
            op: ScriptOp::Options,
            request: None,
            response: None,
        }
    }

    pub fn new(op: ScriptOp, request: WireRequest, response: WireResponse) -> Self {
        Self {
            op,
            request: Some(request),
            response: Some(response),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, PluginError> {
        serde_json::to_string(self).map_err(|e| PluginError::IoError {
            reason: format!("Failed to serialize call: {}", e),
        })
    }
}

impl ScriptReply {
    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, PluginError> {
        let reply: ScriptReply =
            serde_json::from_str(json).map_err(|e| PluginError::InvalidOutput {
                reason: format!("Failed to parse reply JSON: {}", e),
            })?;

        reply.validate()?;
        Ok(reply)
    }

    /// Validate reply according to schema rules
    pub fn validate(&self) -> Result<(), PluginError> {
        if !self.ok && self.error.is_none() {
            return Err(PluginError::InvalidOutput {
                reason: "A failed reply must carry an error message".to_string(),
            });
        }
        Ok(())
    }

    /// Turn a failed reply into the matching plugin error.
    pub fn into_result(self) -> Result<Self, PluginError> {
        if self.ok {
            Ok(self)
        } else {
            let message = self.error.unwrap_or_default();
            Err(PluginError::from_script_message(&message))
        }
    }
}

fn header_map_to_wire(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn wire_to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

impl WireRequest {
    pub fn from_request(request: &Request, with_body: bool) -> Self {
        Self {
            method: request.method().to_string(),
            path: request.path().to_string(),
            query: request.query().map(str::to_string),
            headers: header_map_to_wire(request.headers()),
            body: with_body.then(|| String::from_utf8_lossy(request.body()).into_owned()),
            account: request.account().map(|a| WireAccount {
                name: a.name.clone(),
                roles: a.roles.clone(),
            }),
        }
    }

    /// Copy the plugin's modifications back. Method and path are fixed.
    pub fn apply_to(self, request: &mut Request) {
        *request.headers_mut() = wire_to_header_map(&self.headers);
        if let Some(body) = self.body {
            request.set_body(body.into_bytes());
        }
        request.set_account(self.account.map(|a| Account {
            name: a.name,
            roles: a.roles,
        }));
    }
}

impl WireResponse {
    pub fn from_response(response: &Response, with_body: bool) -> Self {
        Self {
            status: response.status().map(|s| s.as_u16()),
            headers: header_map_to_wire(response.headers()),
            body: with_body.then(|| String::from_utf8_lossy(&response.body()).into_owned()),
            in_error: response.is_in_error(),
            error_message: response.error_message().map(str::to_string),
        }
    }

    pub fn apply_to(self, response: &mut Response) -> Result<(), PluginError> {
        *response.headers_mut() = wire_to_header_map(&self.headers);
        if let Some(body) = self.body {
            response
                .set_body(body.as_bytes())
                .map_err(|e| PluginError::InvalidOutput {
                    reason: e.to_string(),
                })?;
        }

        let status = match self.status {
            Some(code) => Some(StatusCode::from_u16(code).map_err(|_| {
                PluginError::InvalidOutput {
                    reason: format!("invalid status code {code}"),
                }
            })?),
            None => None,
        };

        if self.in_error && !response.is_in_error() {
            response.set_in_error(
                status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                self.error_message.unwrap_or_default(),
            );
        } else if let Some(status) = status {
            response.set_status(status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use http::Method;

    #[test]
    fn test_options_defaults() {
        let options: ScriptOptions = serde_json::from_str(r#"{"name": "audit"}"#).unwrap();

        assert_eq!(options.kind, ScriptKind::Interceptor);
        assert_eq!(options.intercept_point, InterceptPoint::RequestAfterAuth);
        assert_eq!(options.content_kind, ContentKind::ByteArray);
        assert_eq!(options.service_uri(), "/audit");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        let options: ScriptOptions = serde_json::from_str(r#"{"name": " "}"#).unwrap();
        assert!(options.validate().is_err());

        let options: ScriptOptions =
            serde_json::from_str(r#"{"name": "x", "interceptPoint": "ANY"}"#).unwrap();
        assert!(options.validate().is_err());

        let options: ScriptOptions =
            serde_json::from_str(r#"{"name": "svc", "kind": "service", "uri": "nope"}"#).unwrap();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_failed_reply_requires_message() {
        assert!(ScriptReply::from_json(r#"{"ok": false}"#).is_err());

        let reply = ScriptReply::from_json(r#"{"ok": false, "error": "bad"}"#).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(PluginError::ScriptFailed { .. })
        ));
    }

    #[test]
    fn test_response_changes_apply() {
        let mut response = Response::new(BufferPool::new(16, 1024));
        let wire = WireResponse {
            status: Some(418),
            headers: BTreeMap::from([("x-plugin".to_string(), "yes".to_string())]),
            body: Some("short and stout".to_string()),
            in_error: false,
            error_message: None,
        };

        wire.apply_to(&mut response).unwrap();

        assert_eq!(response.status(), Some(StatusCode::IM_A_TEAPOT));
        assert_eq!(response.headers()["x-plugin"], "yes");
        assert_eq!(response.text().unwrap(), "short and stout");
    }

    #[test]
    fn test_request_body_only_sent_when_asked() {
        let request = Request::new(Method::POST, "/coll?page=2".parse().unwrap()).with_body("{}");

        let without = WireRequest::from_request(&request, false);
        assert!(without.body.is_none());
        assert_eq!(without.query.as_deref(), Some("page=2"));

        let with = WireRequest::from_request(&request, true);
        assert_eq!(with.body.as_deref(), Some("{}"));
    }
}
