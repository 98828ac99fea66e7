//! Services: the request handlers a route can be bound to
//!
//! A service produces the response for its mount point. Interceptors whose
//! content kind matches the service's run around it.

mod metrics;
mod ping;

pub use metrics::MetricsService;
pub use ping::PingService;

use crate::exchange::{ContentError, Request, Response};
use crate::script::PluginError;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Failed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Script(#[from] PluginError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

impl ServiceError {
    pub fn missing_dependency(&self) -> Option<String> {
        match self {
            Self::Script(err) => err.missing_dependency(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    async fn handle(&self, request: &Request, response: &mut Response) -> Result<(), ServiceError>;
}
