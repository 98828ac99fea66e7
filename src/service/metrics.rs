use super::{Service, ServiceError};
use crate::exchange::{Request, Response};
use crate::metrics::Metrics;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;

/// Prometheus scrape endpoint.
pub struct MetricsService {
    metrics: Arc<Metrics>,
}

impl MetricsService {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Service for MetricsService {
    async fn handle(&self, _request: &Request, response: &mut Response) -> Result<(), ServiceError> {
        response.set_status(StatusCode::OK);
        response.set_content_type("text/plain; version=0.0.4");
        response.set_body(self.metrics.render().as_bytes())?;
        Ok(())
    }
}
