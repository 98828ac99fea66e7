use super::{Next, Stage};
use crate::config::TracingConfig;
use crate::diagnostic::{self, DiagnosticContext, DIAGNOSTIC_CONTEXT};
use crate::error::PipelineError;
use crate::exchange::Exchange;
use async_trait::async_trait;
use http::header::HeaderName;
use http::HeaderValue;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Establishes the request's diagnostic context.
///
/// The trace id comes from the configured trace header, or a fresh UUID.
/// It and any configured echo headers are put into the context, attached to
/// the exchange and copied onto the response. The rest of the chain runs
/// inside the context's scope.
pub struct TracingInstrumentation {
    config: TracingConfig,
}

impl TracingInstrumentation {
    pub fn new(config: TracingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for TracingInstrumentation {
    fn name(&self) -> &'static str {
        "tracing-instrumentation"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        let (ctx, echoes) = {
            let request = exchange.request().await;
            let trace_id = request
                .header(&self.config.trace_header)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let mut ctx = DiagnosticContext::with_trace_id(trace_id.clone());
            let mut echoes = vec![(self.config.trace_header.as_str(), trace_id)];
            for name in &self.config.echo_headers {
                if let Some(value) = request.header(name) {
                    ctx.insert(name.as_str(), value);
                    echoes.push((name.as_str(), value.to_string()));
                }
            }
            (ctx, echoes)
        };

        {
            let mut response = exchange.response_mut().await;
            for (name, value) in echoes {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
        }

        exchange.attach(DIAGNOSTIC_CONTEXT, ctx.clone());
        let span = ctx.span("request");
        diagnostic::scope(ctx, next.run(exchange))
            .instrument(span)
            .await
    }
}
