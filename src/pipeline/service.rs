use super::{Next, Stage};
use crate::diagnostic;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::plugin::PluginRegistry;
use crate::service::{Service, ServiceError};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::{debug, Instrument};

/// Invokes the service the request was routed to.
///
/// Skipped when the exchange is already in error. Blocking services run on
/// a spawned task so they cannot stall the request task's worker thread.
pub struct ServiceDispatcher {
    registry: Arc<PluginRegistry>,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

async fn invoke(exchange: &Exchange, service: &dyn Service) -> Result<(), ServiceError> {
    let request = exchange.request().await;
    let mut response = exchange.response_mut().await;
    let result = service.handle(&request, &mut response).await;
    if response.is_in_error() {
        exchange.set_in_error();
    }
    result
}

#[async_trait]
impl Stage for ServiceDispatcher {
    fn name(&self) -> &'static str {
        "service-dispatcher"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        if exchange.is_in_error() {
            debug!("Exchange in error, skipping service");
            return next.run(exchange).await;
        }

        let Some(service) = self.registry.handling_service(exchange) else {
            exchange
                .response_mut()
                .await
                .set_in_error(StatusCode::NOT_FOUND, "service no longer deployed");
            return next.run(exchange).await;
        };

        let result = if service.descriptor.blocking {
            let task_exchange = exchange.clone();
            let instance = service.instance.clone();
            let span = tracing::Span::current();
            tokio::spawn(
                diagnostic::scope(diagnostic::snapshot(), async move {
                    invoke(&task_exchange, instance.as_ref()).await
                })
                .instrument(span),
            )
            .await
            .unwrap_or_else(|e| Err(ServiceError::Failed(format!("service task failed: {e}"))))
        } else {
            invoke(exchange, service.instance.as_ref()).await
        };

        result.map_err(|source| PipelineError::Service {
            service: service.name.clone(),
            source,
        })?;

        next.run(exchange).await
    }
}
