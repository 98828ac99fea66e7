use super::SinkConduit;
use crate::exchange::Exchange;
use crate::interceptor::{ContentFilter, InterceptorExecutor};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::warn;

/// Streams bytes to the downstream as they arrive. The head goes out with
/// the first write; interceptors that need the body never see it here.
pub struct PassthroughConduit {
    exchange: Arc<Exchange>,
    executor: Arc<InterceptorExecutor>,
    head_sent: bool,
    terminated: bool,
}

impl PassthroughConduit {
    pub fn new(exchange: Arc<Exchange>, executor: Arc<InterceptorExecutor>) -> Self {
        Self {
            exchange,
            executor,
            head_sent: false,
            terminated: false,
        }
    }

    async fn ensure_head(&mut self) -> io::Result<()> {
        if self.head_sent {
            return Ok(());
        }
        self.head_sent = true;

        let (status, headers) = {
            let response = self.exchange.response().await;
            (response.status_or_ok(), response.headers().clone())
        };
        self.exchange.send_head(status, &headers).await
    }
}

#[async_trait]
impl SinkConduit for PassthroughConduit {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        if self.terminated {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after terminate_writes",
            ));
        }
        self.ensure_head().await?;
        self.exchange.send_chunk(data).await
    }

    async fn terminate_writes(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        // Headers can still change when nothing was written yet.
        let intercepted = self
            .executor
            .execute_response_interceptors(&self.exchange, ContentFilter::ExcludeRequiringContent)
            .await;

        match intercepted {
            // Nothing went out yet, leave the answer to the error reporter.
            Err(e) if !self.head_sent => Err(io::Error::other(e)),
            Err(e) => {
                warn!(error = %e, "Response interceptor failed after the response started");
                self.exchange.end_exchange().await?;
                Err(io::Error::other(e))
            }
            Ok(_) => {
                self.ensure_head().await?;
                self.exchange.end_exchange().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryDownstream;
    use crate::exchange::Request;
    use crate::test_utils::harness;
    use http::Method;

    #[tokio::test]
    async fn test_streams_immediately() {
        let harness = harness();
        let downstream = MemoryDownstream::new();
        let exchange = harness.exchange(
            Request::new(Method::GET, "/api/items".parse().unwrap()),
            downstream.clone(),
        );

        let mut conduit = PassthroughConduit::new(exchange.clone(), harness.executor.clone());
        conduit.write(Bytes::from_static(b"abc")).await.unwrap();

        let recorded = downstream.recorded();
        assert_eq!(recorded.heads, 1);
        assert_eq!(recorded.body(), b"abc");
        assert!(!recorded.ended);

        conduit.write(Bytes::from_static(b"def")).await.unwrap();
        conduit.terminate_writes().await.unwrap();

        let recorded = downstream.recorded();
        assert_eq!(recorded.heads, 1);
        assert_eq!(recorded.body(), b"abcdef");
        assert!(recorded.ended);
        assert!(exchange.response_interceptors_executed());
    }
}
