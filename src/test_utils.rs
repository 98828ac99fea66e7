//! Shared fixtures for unit tests

use crate::buffer::BufferPool;
use crate::conduit::MemoryDownstream;
use crate::diagnostic::{self, TRACE_ID};
use crate::exchange::{Exchange, Request, Response};
use crate::interceptor::{AsyncDispatcher, Interceptor, InterceptorError, InterceptorExecutor};
use crate::metrics::Metrics;
use crate::plugin::PluginRegistry;
use crate::service::{Service, ServiceError};
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Registry, executor and dispatcher wired together over a small pool.
pub struct Harness {
    pub registry: Arc<PluginRegistry>,
    pub executor: Arc<InterceptorExecutor>,
    pub dispatcher: Arc<AsyncDispatcher>,
    pub metrics: Arc<Metrics>,
    pub pool: Arc<BufferPool>,
}

pub fn harness() -> Harness {
    let registry = Arc::new(PluginRegistry::new());
    let dispatcher = Arc::new(AsyncDispatcher::new(4));
    let metrics = Arc::new(Metrics::new());
    let executor = Arc::new(InterceptorExecutor::new(
        registry.clone(),
        dispatcher.clone(),
        metrics.clone(),
    ));

    Harness {
        registry,
        executor,
        dispatcher,
        metrics,
        pool: BufferPool::new(16, 1024),
    }
}

impl Harness {
    pub fn exchange(&self, request: Request, downstream: MemoryDownstream) -> Arc<Exchange> {
        Exchange::new(request, self.pool.clone(), Box::new(downstream))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Apply,
    DoesNotApply,
    FailHandle(&'static str),
    FailResolve(&'static str),
    /// Mark the response in error with this status
    Reject(StatusCode),
    /// Record the diagnostic trace id seen while handling
    CaptureTraceId,
}

#[derive(Default)]
struct Log {
    resolved: Vec<String>,
    handled: Vec<String>,
    trace_ids: Vec<String>,
}

/// Interceptor factory whose instances write into one shared log.
#[derive(Clone, Default)]
pub struct Recording {
    log: Arc<Mutex<Log>>,
}

impl Recording {
    pub fn interceptor(&self, name: &str) -> Arc<dyn Interceptor> {
        self.interceptor_with(name, Behavior::Apply)
    }

    pub fn interceptor_with(&self, name: &str, behavior: Behavior) -> Arc<dyn Interceptor> {
        Arc::new(RecordingInterceptor {
            name: name.to_string(),
            behavior,
            log: self.log.clone(),
        })
    }

    pub fn resolved(&self) -> Vec<String> {
        self.log.lock().resolved.clone()
    }

    pub fn handled(&self) -> Vec<String> {
        self.log.lock().handled.clone()
    }

    pub fn trace_ids(&self) -> Vec<String> {
        self.log.lock().trace_ids.clone()
    }

    pub fn clear(&self) {
        *self.log.lock() = Log::default();
    }
}

struct RecordingInterceptor {
    name: String,
    behavior: Behavior,
    log: Arc<Mutex<Log>>,
}

#[async_trait]
impl Interceptor for RecordingInterceptor {
    async fn resolve(&self, _request: &Request, _response: &Response) -> Result<bool, InterceptorError> {
        self.log.lock().resolved.push(self.name.clone());
        match self.behavior {
            Behavior::DoesNotApply => Ok(false),
            Behavior::FailResolve(msg) => Err(InterceptorError::failed(msg)),
            _ => Ok(true),
        }
    }

    async fn handle(
        &self,
        _request: &mut Request,
        response: &mut Response,
    ) -> Result<(), InterceptorError> {
        let mut log = self.log.lock();
        log.handled.push(self.name.clone());
        match self.behavior {
            Behavior::FailHandle(msg) => Err(InterceptorError::failed(msg)),
            Behavior::Reject(status) => {
                response.set_in_error(status, format!("rejected by {}", self.name));
                Ok(())
            }
            Behavior::CaptureTraceId => {
                if let Some(trace_id) = diagnostic::get(TRACE_ID) {
                    log.trace_ids.push(trace_id);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Service answering every request with the same JSON body.
pub struct StaticService {
    body: Value,
}

impl StaticService {
    pub fn json(body: Value) -> Self {
        Self { body }
    }
}

#[async_trait]
impl Service for StaticService {
    async fn handle(&self, _request: &Request, response: &mut Response) -> Result<(), ServiceError> {
        response.set_status(StatusCode::OK);
        response.set_json(&self.body)?;
        Ok(())
    }
}
