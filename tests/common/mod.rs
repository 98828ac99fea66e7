//! Fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use restpipe::conduit::{MemoryDownstream, Recorded};
use restpipe::config::Config;
use restpipe::exchange::{Request, Response};
use restpipe::gateway::Gateway;
use restpipe::interceptor::{Interceptor, InterceptorError};
use restpipe::service::{Service, ServiceError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn gateway(config: Config) -> Gateway {
    Gateway::builder(config).build().unwrap()
}

/// Run one in-process request through the gateway and wait for async
/// interceptors to settle.
pub async fn send(gateway: &Gateway, method: Method, uri: &str, body: &[u8]) -> Recorded {
    let downstream = MemoryDownstream::new();
    let request = Request::new(method, uri.parse().unwrap()).with_body(Bytes::copy_from_slice(body));
    let exchange = gateway.exchange(request, Box::new(downstream.clone()));
    gateway.handle(exchange).await;
    gateway.dispatcher().wait_idle().await;
    downstream.recorded()
}

pub fn json(recorded: &Recorded) -> serde_json::Value {
    serde_json::from_slice(&recorded.body()).unwrap()
}

pub type Mutation = fn(&mut Request, &mut Response) -> Result<(), InterceptorError>;

/// Interceptor that records each call in a shared log.
pub struct LoggingInterceptor {
    name: String,
    applies: bool,
    mutation: Option<Mutation>,
    log: Arc<Mutex<Vec<String>>>,
    handled: AtomicUsize,
}

impl LoggingInterceptor {
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn resolve(&self, _request: &Request, _response: &Response) -> Result<bool, InterceptorError> {
        Ok(self.applies)
    }

    async fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), InterceptorError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(self.name.clone());
        match self.mutation {
            Some(mutation) => mutation(request, response),
            None => Ok(()),
        }
    }
}

/// Builds logging interceptors that share one log.
#[derive(Clone, Default)]
pub struct CallLog {
    log: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn interceptor(&self, name: &str) -> Arc<LoggingInterceptor> {
        self.build(name, true, None)
    }

    pub fn skipping(&self, name: &str) -> Arc<LoggingInterceptor> {
        self.build(name, false, None)
    }

    pub fn mutating(&self, name: &str, mutation: Mutation) -> Arc<LoggingInterceptor> {
        self.build(name, true, Some(mutation))
    }

    fn build(&self, name: &str, applies: bool, mutation: Option<Mutation>) -> Arc<LoggingInterceptor> {
        Arc::new(LoggingInterceptor {
            name: name.to_string(),
            applies,
            mutation,
            log: self.log.clone(),
            handled: AtomicUsize::new(0),
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

/// Service answering a fixed JSON document and counting its calls.
pub struct CountingService {
    body: serde_json::Value,
    calls: AtomicUsize,
}

impl CountingService {
    pub fn new(body: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            body,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for CountingService {
    async fn handle(&self, _request: &Request, response: &mut Response) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        response.set_status(StatusCode::OK);
        response.set_json(&self.body)?;
        Ok(())
    }
}
