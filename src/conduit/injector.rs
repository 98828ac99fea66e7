use super::{ConduitMode, CONDUIT_MODE, ORIGINAL_ACCEPT_ENCODING};
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::interceptor::InterceptPoint;
use crate::pipeline::{Next, Stage};
use crate::plugin::PluginRegistry;
use async_trait::async_trait;
use http::{header, HeaderValue};
use std::sync::Arc;
use tracing::debug;

/// Picks the conduit for a proxied exchange.
///
/// Buffering is only worth its cost when some proxy response interceptor
/// wants the body. In that case the upstream is asked for an uncompressed
/// body, since interceptors cannot read a gzip stream.
pub struct ConduitInjector {
    registry: Arc<PluginRegistry>,
}

impl ConduitInjector {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn requires_buffering(&self) -> bool {
        [InterceptPoint::Response, InterceptPoint::ResponseAsync]
            .into_iter()
            .flat_map(|point| self.registry.proxy_interceptors(point))
            .any(|record| record.descriptor.requires_content)
    }
}

#[async_trait]
impl Stage for ConduitInjector {
    fn name(&self) -> &'static str {
        "conduit-injector"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        if self.requires_buffering() {
            let mut request = exchange.request_mut().await;
            if let Some(original) = request.headers_mut().remove(header::ACCEPT_ENCODING) {
                exchange.attach(ORIGINAL_ACCEPT_ENCODING, original);
            }
            request
                .headers_mut()
                .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            drop(request);

            debug!(exchange = %exchange.id(), "Buffering response content");
            exchange.attach(CONDUIT_MODE, ConduitMode::Buffering);
        } else {
            exchange.attach(CONDUIT_MODE, ConduitMode::Passthrough);
        }

        next.run(exchange).await
    }
}
