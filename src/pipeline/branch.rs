use super::cors::add_cors_headers;
use super::error::error_body;
use super::sender::send_response;
use super::{Next, Stage};
use crate::config::CorsConfig;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::routing::PipelineInfo;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::{debug, warn};

/// Continues with the service, proxy or unrouted chain depending on where
/// the request was routed. Stages after the branch never run.
pub struct Branch {
    service: Vec<Arc<dyn Stage>>,
    proxy: Vec<Arc<dyn Stage>>,
    unrouted: Vec<Arc<dyn Stage>>,
}

impl Branch {
    pub fn new(
        service: Vec<Arc<dyn Stage>>,
        proxy: Vec<Arc<dyn Stage>>,
        unrouted: Vec<Arc<dyn Stage>>,
    ) -> Self {
        Self {
            service,
            proxy,
            unrouted,
        }
    }
}

#[async_trait]
impl Stage for Branch {
    fn name(&self) -> &'static str {
        "branch"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, _next: Next<'_>) -> Result<(), PipelineError> {
        let chain = match exchange.pipeline_info().as_deref() {
            Some(PipelineInfo::Service { .. }) => &self.service,
            Some(PipelineInfo::Proxy { .. }) => &self.proxy,
            Some(PipelineInfo::Unrouted) | None => &self.unrouted,
        };
        Next::new(chain).run(exchange).await
    }
}

/// Answers 404 for requests no service or proxy is mounted for.
#[derive(Debug, Clone, Default)]
pub struct NotFound {
    cors: CorsConfig,
}

impl NotFound {
    pub fn new(cors: CorsConfig) -> Self {
        Self { cors }
    }
}

#[async_trait]
impl Stage for NotFound {
    fn name(&self) -> &'static str {
        "not-found"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, _next: Next<'_>) -> Result<(), PipelineError> {
        let (path, is_options) = {
            let request = exchange.request().await;
            (request.path().to_string(), request.is_options())
        };
        debug!(path = %path, "No service or proxy bound");

        {
            let mut response = exchange.response_mut().await;
            response.set_in_error(StatusCode::NOT_FOUND, "not found");
            if let Err(e) = response.set_json(&error_body(StatusCode::NOT_FOUND, "not found")) {
                warn!(error = %e, "Could not write the not found body");
            }
            add_cors_headers(response.headers_mut(), &self.cors, is_options);
        }

        send_response(exchange).await?;
        Ok(())
    }
}
