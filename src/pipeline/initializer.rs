use super::{Next, Stage};
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::routing::{strip_mount, Router, PIPELINE_INFO};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

/// Routes the request and checks its content.
///
/// Attaches the [`PipelineInfo`](crate::routing::PipelineInfo) and sets the
/// resource path relative to the mount point. Bodies over the maximum
/// content size are rejected with 413.
pub struct RequestInitializer {
    router: Arc<dyn Router>,
    max_content_size: usize,
}

impl RequestInitializer {
    pub fn new(router: Arc<dyn Router>, max_content_size: usize) -> Self {
        Self {
            router,
            max_content_size,
        }
    }
}

#[async_trait]
impl Stage for RequestInitializer {
    fn name(&self) -> &'static str {
        "request-initializer"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        let info = {
            let mut request = exchange.request_mut().await;

            if request.body().len() > self.max_content_size {
                return Err(PipelineError::malformed(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!(
                        "request content exceeds the maximum size of {} bytes",
                        self.max_content_size
                    ),
                ));
            }

            let path = request.path().to_string();
            let info = self.router.route(&path);
            if let Some(prefix) = info.prefix() {
                request.set_resource_path(strip_mount(&path, prefix));
            }
            debug!(path = %path, route = ?info, "Routed request");
            info
        };

        exchange.attach(PIPELINE_INFO, info);
        next.run(exchange).await
    }
}
