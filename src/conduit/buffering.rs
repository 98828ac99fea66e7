use super::SinkConduit;
use crate::exchange::Exchange;
use crate::interceptor::{ContentFilter, InterceptorExecutor};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue};
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Holds the body in the exchange's pooled response content until
/// [`terminate_writes`](SinkConduit::terminate_writes), then runs the response
/// interceptors and writes the (possibly rewritten) body with a recomputed
/// `Content-Length`.
pub struct BufferingConduit {
    exchange: Arc<Exchange>,
    executor: Arc<InterceptorExecutor>,
    terminated: bool,
}

impl BufferingConduit {
    pub fn new(exchange: Arc<Exchange>, executor: Arc<InterceptorExecutor>) -> Self {
        Self {
            exchange,
            executor,
            terminated: false,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.executor
            .execute_response_interceptors(&self.exchange, ContentFilter::All)
            .await
            .map_err(io::Error::other)?;

        let (status, headers, chunks) = {
            let response = self.exchange.response().await;
            let mut headers = response.headers().clone();
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from(response.content().len()),
            );
            let chunks: Vec<Bytes> = response
                .content()
                .chunks()
                .map(Bytes::copy_from_slice)
                .collect();
            (response.status_or_ok(), headers, chunks)
        };

        debug!(
            status = status.as_u16(),
            chunks = chunks.len(),
            "Flushing buffered response"
        );

        self.exchange.send_head(status, &headers).await?;
        for chunk in chunks {
            self.exchange.send_chunk(chunk).await?;
        }
        self.exchange.end_exchange().await
    }
}

#[async_trait]
impl SinkConduit for BufferingConduit {
    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        if self.terminated {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after terminate_writes",
            ));
        }

        self.executor.metrics().record_buffered_bytes(data.len());
        let mut response = self.exchange.response_mut().await;
        response.content_mut().append(&data)?;
        Ok(())
    }

    async fn terminate_writes(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        let result = self.flush().await;
        self.exchange.response_mut().await.content_mut().release();
        result
    }
}
