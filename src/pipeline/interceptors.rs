use super::cors::add_cors_headers;
use super::sender::send_response;
use super::{Next, Stage};
use crate::config::CorsConfig;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::interceptor::{ContentFilter, InterceptPoint, InterceptorExecutor};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

/// Runs the interceptor wave of one request-side intercept point.
///
/// After `REQUEST_AFTER_AUTH`, an exchange left in error is answered right
/// away: the status defaults to 400, CORS headers are added and the rest of
/// the chain is skipped.
pub struct InterceptorsStage {
    executor: Arc<InterceptorExecutor>,
    point: InterceptPoint,
    cors: CorsConfig,
}

impl InterceptorsStage {
    pub fn new(executor: Arc<InterceptorExecutor>, point: InterceptPoint, cors: CorsConfig) -> Self {
        Self {
            executor,
            point,
            cors,
        }
    }

    async fn short_circuit(&self, exchange: &Arc<Exchange>) -> Result<(), PipelineError> {
        let preflight = exchange.request().await.is_options();
        {
            let mut response = exchange.response_mut().await;
            if response.status().is_none() {
                response.set_status(StatusCode::BAD_REQUEST);
            }
            add_cors_headers(response.headers_mut(), &self.cors, preflight);
            debug!(
                status = response.status_or_ok().as_u16(),
                "Request rejected by interceptors"
            );
        }
        send_response(exchange).await?;
        Ok(())
    }
}

#[async_trait]
impl Stage for InterceptorsStage {
    fn name(&self) -> &'static str {
        match self.point {
            InterceptPoint::RequestBeforeExchangeInit => "interceptors-before-exchange-init",
            InterceptPoint::RequestBeforeAuth => "interceptors-before-auth",
            InterceptPoint::RequestAfterAuth => "interceptors-after-auth",
            InterceptPoint::Response | InterceptPoint::ResponseAsync => "interceptors-response",
            InterceptPoint::Any => "interceptors",
        }
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        self.executor
            .execute(exchange, self.point, ContentFilter::All)
            .await?;

        if self.point == InterceptPoint::RequestAfterAuth && exchange.is_in_error() {
            return self.short_circuit(exchange).await;
        }

        next.run(exchange).await
    }
}

/// Runs the response interceptors over a fully buffered service response.
pub struct ResponseInterceptors {
    executor: Arc<InterceptorExecutor>,
}

impl ResponseInterceptors {
    pub fn new(executor: Arc<InterceptorExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Stage for ResponseInterceptors {
    fn name(&self) -> &'static str {
        "response-interceptors"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        self.executor
            .execute_response_interceptors(exchange, ContentFilter::All)
            .await?;
        next.run(exchange).await
    }
}
