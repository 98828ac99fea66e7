use crate::changestream::ChangeStreamError;
use crate::interceptor::{InterceptPoint, InterceptorError};
use crate::script::PluginError;
use crate::service::ServiceError;
use http::StatusCode;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Change stream error: {0}")]
    ChangeStream(#[from] ChangeStreamError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Errors raised while a request travels through the handler chain.
///
/// The terminal error stage turns these into the client-visible response,
/// see [`PipelineError::status`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Error resolving interceptor {interceptor} on intercept point {point}: {source}")]
    InterceptorResolution {
        interceptor: String,
        point: InterceptPoint,
        #[source]
        source: InterceptorError,
    },

    #[error(
        "Error executing interceptor {interceptor} on intercept point {point} after {elapsed_ms}ms: {source}"
    )]
    InterceptorExecution {
        interceptor: String,
        point: InterceptPoint,
        elapsed_ms: u64,
        #[source]
        source: InterceptorError,
    },

    #[error("Plugin {plugin} is missing a dependency: {reason}")]
    MissingDependency { plugin: String, reason: String },

    #[error("{message}")]
    MalformedRequest { status: StatusCode, message: String },

    #[error("Error executing service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: ServiceError,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn malformed(status: StatusCode, message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            status,
            message: message.into(),
        }
    }

    /// Name of the plugin whose dependency could not be loaded, if this
    /// error is a linkage failure rather than a runtime one.
    pub fn missing_dependency(&self) -> Option<(&str, String)> {
        match self {
            Self::MissingDependency { plugin, reason } => Some((plugin, reason.clone())),
            Self::InterceptorResolution {
                interceptor,
                source,
                ..
            }
            | Self::InterceptorExecution {
                interceptor,
                source,
                ..
            } => source
                .missing_dependency()
                .map(|reason| (interceptor.as_str(), reason)),
            Self::Service { service, source } => source
                .missing_dependency()
                .map(|reason| (service.as_str(), reason)),
            _ => None,
        }
    }

    /// Status code the terminal error stage answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest { status, .. } => *status,
            Self::Service {
                source: ServiceError::BadRequest(_),
                ..
            } => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client errors do not mark the exchange as a server-side failure.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Recover a pipeline error that crossed an I/O boundary, such as the
    /// buffering conduit's `terminate_writes`.
    pub fn from_io(err: &io::Error) -> Option<&PipelineError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<PipelineError>())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
