//! Byte-output path between the pipeline and the transport
//!
//! A [`SinkConduit`] receives the response body. The [`BufferingConduit`]
//! holds it in pooled buffers so response interceptors can read and rewrite
//! it before anything reaches the client; the [`PassthroughConduit`] streams
//! straight to the [`Downstream`]. The [`ConduitInjector`] stage decides
//! which one a proxied exchange gets.

mod buffering;
mod injector;
mod passthrough;

pub use buffering::BufferingConduit;
pub use injector::ConduitInjector;
pub use passthrough::PassthroughConduit;

use crate::exchange::{AttachmentKey, Exchange};
use crate::interceptor::InterceptorExecutor;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Which conduit the exchange's body goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConduitMode {
    Buffering,
    Passthrough,
}

pub const CONDUIT_MODE: AttachmentKey<ConduitMode> = AttachmentKey::new("conduit-mode");

/// `Accept-Encoding` the client sent before buffering forced `identity`.
pub const ORIGINAL_ACCEPT_ENCODING: AttachmentKey<HeaderValue> =
    AttachmentKey::new("original-accept-encoding");

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("content exceeds the maximum size of {limit} bytes")]
    ContentTooLarge { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ConduitError> for io::Error {
    fn from(err: ConduitError) -> Self {
        match err {
            ConduitError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

/// Transport-side sink for one response.
#[async_trait]
pub trait Downstream: Send {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;

    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    async fn end(&mut self) -> io::Result<()>;
}

/// Writer for a response body.
#[async_trait]
pub trait SinkConduit: Send {
    async fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Finish the body. Runs response interceptors if nobody has yet.
    async fn terminate_writes(&mut self) -> io::Result<()>;
}

/// Conduit chosen for `exchange` by the [`ConduitInjector`], passthrough
/// when none was chosen.
pub fn for_exchange(
    exchange: &Arc<Exchange>,
    executor: &Arc<InterceptorExecutor>,
) -> Box<dyn SinkConduit> {
    let mode = exchange
        .attachment(CONDUIT_MODE)
        .map(|m| *m)
        .unwrap_or(ConduitMode::Passthrough);

    match mode {
        ConduitMode::Buffering => Box::new(BufferingConduit::new(exchange.clone(), executor.clone())),
        ConduitMode::Passthrough => {
            Box::new(PassthroughConduit::new(exchange.clone(), executor.clone()))
        }
    }
}

/// What a [`MemoryDownstream`] has seen.
#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    pub heads: usize,
    pub ended: bool,
}

impl Recorded {
    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

/// In-memory downstream for tests and benches.
#[derive(Debug, Default, Clone)]
pub struct MemoryDownstream {
    inner: Arc<Mutex<Recorded>>,
}

impl MemoryDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Recorded {
        self.inner.lock().clone()
    }
}

#[async_trait]
impl Downstream for MemoryDownstream {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.status = Some(status);
        inner.headers = headers.clone();
        inner.heads += 1;
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.inner.lock().chunks.push(chunk);
        Ok(())
    }

    async fn end(&mut self) -> io::Result<()> {
        self.inner.lock().ended = true;
        Ok(())
    }
}
