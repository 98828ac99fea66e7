use super::{Next, Stage};
use crate::conduit::{PassthroughConduit, SinkConduit};
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::interceptor::InterceptorExecutor;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue};
use std::io;
use std::sync::Arc;

/// Set `Content-Length` from the buffered body and take the body out.
async fn finalize_body(exchange: &Exchange) -> Bytes {
    let mut response = exchange.response_mut().await;
    let body = response.body();
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    response.content_mut().release();
    body
}

/// Send the response as it stands and end the exchange, bypassing response
/// interceptors. Used for answers the pipeline produces itself.
pub async fn send_response(exchange: &Arc<Exchange>) -> io::Result<()> {
    let body = finalize_body(exchange).await;
    let (status, headers) = {
        let response = exchange.response().await;
        (response.status_or_ok(), response.headers().clone())
    };

    exchange.send_head(status, &headers).await?;
    exchange.send_chunk(body).await?;
    exchange.end_exchange().await
}

/// Writes the service's response through a passthrough conduit.
pub struct ResponseSender {
    executor: Arc<InterceptorExecutor>,
}

impl ResponseSender {
    pub fn new(executor: Arc<InterceptorExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Stage for ResponseSender {
    fn name(&self) -> &'static str {
        "response-sender"
    }

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError> {
        if exchange.is_response_started() {
            return next.run(exchange).await;
        }

        let body = finalize_body(exchange).await;
        let mut conduit = PassthroughConduit::new(exchange.clone(), self.executor.clone());
        conduit.write(body).await?;
        conduit.terminate_writes().await?;

        next.run(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryDownstream;
    use crate::exchange::Request;
    use crate::pipeline::Pipeline;
    use crate::test_utils::harness;
    use http::{Method, StatusCode};

    #[tokio::test]
    async fn test_sends_buffered_body_with_length() {
        let harness = harness();
        let downstream = MemoryDownstream::new();
        let exchange = harness.exchange(
            Request::new(Method::GET, "/ping".parse().unwrap()),
            downstream.clone(),
        );
        {
            let mut response = exchange.response_mut().await;
            response.set_status(StatusCode::ACCEPTED);
            response.set_body(b"queued for later").unwrap();
        }

        Pipeline::builder()
            .stage(ResponseSender::new(harness.executor.clone()))
            .build()
            .execute(exchange.clone())
            .await;

        let recorded = downstream.recorded();
        assert_eq!(recorded.status, Some(StatusCode::ACCEPTED));
        assert_eq!(recorded.headers[header::CONTENT_LENGTH], "16");
        assert_eq!(recorded.body(), b"queued for later");
        assert!(recorded.ended);
        assert_eq!(harness.pool.outstanding(), 0);
    }
}
