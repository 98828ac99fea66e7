//! Per-request state shared by the pipeline stages
//!
//! One [`Exchange`] exists per inbound request. Stages and async interceptor
//! tasks share it as `Arc<Exchange>`. The request and response views sit
//! behind async read/write locks; when both are needed the request lock is
//! always taken first.

mod attachments;
mod content;
mod request;
mod response;

pub use attachments::{AttachmentKey, Attachments};
pub use content::{ContentError, ContentKind};
pub use request::{Account, Request};
pub use response::Response;

use crate::buffer::BufferPool;
use crate::conduit::Downstream;
use crate::routing::{PipelineInfo, PIPELINE_INFO};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

pub struct Exchange {
    id: Uuid,
    request: RwLock<Request>,
    response: RwLock<Response>,
    in_error: AtomicBool,
    response_interceptors_executed: AtomicBool,
    response_started: AtomicBool,
    ended: AtomicBool,
    attachments: Attachments,
    downstream: Mutex<Box<dyn Downstream>>,
    pool: Arc<BufferPool>,
}

impl Exchange {
    pub fn new(request: Request, pool: Arc<BufferPool>, downstream: Box<dyn Downstream>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            request: RwLock::new(request),
            response: RwLock::new(Response::new(pool.clone())),
            in_error: AtomicBool::new(false),
            response_interceptors_executed: AtomicBool::new(false),
            response_started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            attachments: Attachments::default(),
            downstream: Mutex::new(downstream),
            pool,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub async fn request(&self) -> RwLockReadGuard<'_, Request> {
        self.request.read().await
    }

    pub async fn request_mut(&self) -> RwLockWriteGuard<'_, Request> {
        self.request.write().await
    }

    pub async fn response(&self) -> RwLockReadGuard<'_, Response> {
        self.response.read().await
    }

    pub async fn response_mut(&self) -> RwLockWriteGuard<'_, Response> {
        self.response.write().await
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn set_in_error(&self) {
        self.in_error.store(true, Ordering::Release);
    }

    /// Claim the right to run response interceptors. Returns `true` for the
    /// single caller that flips the flag.
    pub fn mark_response_interceptors_executed(&self) -> bool {
        self.response_interceptors_executed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn response_interceptors_executed(&self) -> bool {
        self.response_interceptors_executed.load(Ordering::Acquire)
    }

    pub fn is_response_started(&self) -> bool {
        self.response_started.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn attach<T: Any + Send + Sync>(&self, key: AttachmentKey<T>, value: T) {
        self.attachments.put(key, value);
    }

    pub fn attachment<T: Any + Send + Sync>(&self, key: AttachmentKey<T>) -> Option<Arc<T>> {
        self.attachments.get(key)
    }

    pub fn detach<T: Any + Send + Sync>(&self, key: AttachmentKey<T>) -> Option<Arc<T>> {
        self.attachments.remove(key)
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn pipeline_info(&self) -> Option<Arc<PipelineInfo>> {
        self.attachment(PIPELINE_INFO)
    }

    pub async fn send_head(&self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        if self.response_started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "response head already sent",
            ));
        }
        self.downstream.lock().await.send_head(status, headers).await
    }

    pub async fn send_chunk(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.downstream.lock().await.send_chunk(chunk).await
    }

    /// End the exchange. Only the first call reaches the downstream.
    pub async fn end_exchange(&self) -> io::Result<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.downstream.lock().await.end().await
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("in_error", &self.is_in_error())
            .field("response_started", &self.is_response_started())
            .field("attachments", &self.attachments)
            .finish()
    }
}
