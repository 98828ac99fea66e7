//! Handler chain
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Each stage receives the
//! exchange and a [`Next`] handle for the rest of the chain: it forwards with
//! `next.run(exchange)`, ends the exchange by not calling it, or returns an
//! error. Errors unwind to [`Pipeline::execute`], which hands them to the
//! [`ErrorReporter`].

mod branch;
mod cors;
mod error;
mod initializer;
mod instrumentation;
mod interceptors;
mod security;
mod sender;
mod service;

pub use branch::{Branch, NotFound};
pub use cors::add_cors_headers;
pub(crate) use error::error_body;
pub use error::ErrorReporter;
pub use initializer::RequestInitializer;
pub use instrumentation::TracingInstrumentation;
pub use interceptors::{InterceptorsStage, ResponseInterceptors};
pub use security::{AnonymousAuthenticator, AuthOutcome, Authenticator, Security};
pub use sender::{send_response, ResponseSender};
pub use service::ServiceDispatcher;

use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::metrics::{Metrics, RequestTimer};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, exchange: &Arc<Exchange>, next: Next<'_>) -> Result<(), PipelineError>;
}

/// The stages after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub fn new(stages: &'a [Arc<dyn Stage>]) -> Self {
        Self { rest: stages }
    }

    /// Hand the exchange to the next stage. A no-op at the end of the chain.
    pub async fn run(self, exchange: &Arc<Exchange>) -> Result<(), PipelineError> {
        match self.rest.split_first() {
            Some((stage, rest)) => {
                tracing::trace!(stage = stage.name(), "Entering stage");
                stage.handle(exchange, Next { rest }).await
            }
            None => Ok(()),
        }
    }

    pub fn is_end(&self) -> bool {
        self.rest.is_empty()
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    reporter: ErrorReporter,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the exchange through every stage. Errors are answered by the
    /// error reporter; nothing is returned to the caller.
    pub async fn execute(&self, exchange: Arc<Exchange>) {
        let timer = self.metrics.clone().map(RequestTimer::new);

        if let Err(err) = Next::new(&self.stages).run(&exchange).await {
            self.reporter.report(&exchange, err).await;
        }

        if let Some(timer) = timer {
            if exchange.response().await.status_or_ok().is_server_error() {
                timer.fail();
            } else {
                timer.finish();
            }
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    reporter: Option<ErrorReporter>,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            reporter: self.reporter.unwrap_or_default(),
            metrics: self.metrics,
        }
    }

    /// Stages only, for a [`Branch`] arm.
    pub fn into_chain(self) -> Vec<Arc<dyn Stage>> {
        self.stages
    }
}
