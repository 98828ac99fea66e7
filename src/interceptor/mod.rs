//! Interceptors and the protocol that runs them
//!
//! An interceptor is registered against one [`InterceptPoint`]. At that point
//! the executor asks every candidate whether it applies (`resolve`) and then
//! runs the applicable ones (`handle`) in priority order.
//!
//! # Modules
//!
//! - `executor`: interceptor waves, response-side gating, error wrapping
//! - `dispatch`: fire-and-forget execution of `RESPONSE_ASYNC` interceptors

pub mod dispatch;
pub mod executor;

pub use dispatch::AsyncDispatcher;
pub use executor::{ContentFilter, InterceptorExecutor, WaveOutcome, WaveState};

use crate::exchange::{ContentError, Request, Response};
use crate::script::PluginError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Named moment in the pipeline where an interceptor wave runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterceptPoint {
    /// Before the request is routed and its content is read
    RequestBeforeExchangeInit,
    RequestBeforeAuth,
    RequestAfterAuth,
    Response,
    /// Dispatched off the response path, see [`AsyncDispatcher`]
    ResponseAsync,
    /// Only meaningful in a service's opt-out list
    Any,
}

impl InterceptPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestBeforeExchangeInit => "REQUEST_BEFORE_EXCHANGE_INIT",
            Self::RequestBeforeAuth => "REQUEST_BEFORE_AUTH",
            Self::RequestAfterAuth => "REQUEST_AFTER_AUTH",
            Self::Response => "RESPONSE",
            Self::ResponseAsync => "RESPONSE_ASYNC",
            Self::Any => "ANY",
        }
    }

    pub fn is_response_side(&self) -> bool {
        matches!(self, Self::Response | Self::ResponseAsync)
    }
}

impl fmt::Display for InterceptPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterceptPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REQUEST_BEFORE_EXCHANGE_INIT" => Ok(Self::RequestBeforeExchangeInit),
            "REQUEST_BEFORE_AUTH" => Ok(Self::RequestBeforeAuth),
            "REQUEST_AFTER_AUTH" | "REQUEST" => Ok(Self::RequestAfterAuth),
            "RESPONSE" => Ok(Self::Response),
            "RESPONSE_ASYNC" => Ok(Self::ResponseAsync),
            "ANY" => Ok(Self::Any),
            other => Err(format!("unknown intercept point '{other}'")),
        }
    }
}

/// Errors raised by an interceptor's `resolve` or `handle`.
#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Script(#[from] PluginError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("missing dependency {dependency}: {reason}")]
    MissingDependency { dependency: String, reason: String },
}

impl InterceptorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Reason text when the failure comes from code the plugin could not load.
    pub fn missing_dependency(&self) -> Option<String> {
        match self {
            Self::MissingDependency { reason, .. } => Some(reason.clone()),
            Self::Script(err) => err.missing_dependency(),
            _ => None,
        }
    }
}

/// Request/response mutator registered against one intercept point.
///
/// `resolve` must not mutate; it may fail, in which case the interceptor is
/// excluded from the wave and the wave fails. `handle` runs only when
/// `resolve` returned `true`.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn resolve(&self, request: &Request, response: &Response)
        -> Result<bool, InterceptorError>;

    async fn handle(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), InterceptorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intercept_point_round_trip() {
        for point in [
            InterceptPoint::RequestBeforeExchangeInit,
            InterceptPoint::RequestBeforeAuth,
            InterceptPoint::RequestAfterAuth,
            InterceptPoint::Response,
            InterceptPoint::ResponseAsync,
            InterceptPoint::Any,
        ] {
            assert_eq!(point.to_string().parse::<InterceptPoint>().unwrap(), point);
        }

        assert!("LATER".parse::<InterceptPoint>().is_err());
    }

    #[test]
    fn test_intercept_point_serde() {
        let json = serde_json::to_string(&InterceptPoint::ResponseAsync).unwrap();
        assert_eq!(json, "\"RESPONSE_ASYNC\"");

        let point: InterceptPoint = serde_json::from_str("\"REQUEST_AFTER_AUTH\"").unwrap();
        assert_eq!(point, InterceptPoint::RequestAfterAuth);
    }

    #[test]
    fn test_missing_dependency_from_script() {
        let err = InterceptorError::Script(PluginError::MissingModule {
            module: "left-pad".to_string(),
            reason: "Cannot find module 'left-pad'".to_string(),
        });
        assert!(err.missing_dependency().unwrap().contains("left-pad"));
        assert!(InterceptorError::failed("boom").missing_dependency().is_none());
    }
}
