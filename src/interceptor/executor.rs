//! Interceptor waves
//!
//! A wave is one pass over the interceptors registered at an intercept point:
//!
//! 1. take the candidates for the exchange (handling service or proxy),
//! 2. keep only required ones if the service opts out of the point,
//! 3. optionally drop those that need the response body,
//! 4. `resolve` every candidate,
//! 5. `handle` the applicable ones in priority order.
//!
//! A failing `resolve` excludes that interceptor, flags the exchange and is
//! logged; the remaining candidates are still resolved, then the wave fails
//! with the first resolution error before any `handle` runs. A failing
//! `handle` flags the exchange and stops the wave.

use super::dispatch::AsyncDispatcher;
use super::InterceptPoint;
use crate::error::PipelineError;
use crate::exchange::Exchange;
use crate::metrics::Metrics;
use crate::plugin::{InterceptorRecord, PluginRegistry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveState {
    Pending,
    Resolving,
    /// No candidate applied
    Skipped,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WaveOutcome {
    pub state: WaveState,
    /// Names of the interceptors whose `handle` ran, in order
    pub executed: Vec<String>,
}

impl WaveOutcome {
    fn skipped() -> Self {
        Self {
            state: WaveState::Skipped,
            executed: Vec::new(),
        }
    }
}

/// Which interceptors the caller can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFilter {
    All,
    /// The caller streams the body and cannot offer it to interceptors
    ExcludeRequiringContent,
}

pub struct InterceptorExecutor {
    registry: Arc<PluginRegistry>,
    dispatcher: Arc<AsyncDispatcher>,
    metrics: Arc<Metrics>,
}

impl InterceptorExecutor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        dispatcher: Arc<AsyncDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<AsyncDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one wave at `point`.
    pub async fn execute(
        &self,
        exchange: &Arc<Exchange>,
        point: InterceptPoint,
        filter: ContentFilter,
    ) -> Result<WaveOutcome, PipelineError> {
        let span = tracing::debug_span!("interceptor_wave", point = %point, exchange = %exchange.id());
        self.run_wave(exchange, point, filter).instrument(span).await
    }

    /// Run the `RESPONSE_ASYNC` and `RESPONSE` interceptors unless another
    /// call site already did. Async ones are dispatched first, then the
    /// synchronous wave runs. Returns `false` when this call did nothing.
    pub async fn execute_response_interceptors(
        &self,
        exchange: &Arc<Exchange>,
        filter: ContentFilter,
    ) -> Result<bool, PipelineError> {
        if !exchange.mark_response_interceptors_executed() {
            trace!(exchange = %exchange.id(), "Response interceptors already executed");
            return Ok(false);
        }

        self.dispatch_async(exchange, filter).await;
        self.execute(exchange, InterceptPoint::Response, filter).await?;
        Ok(true)
    }

    async fn run_wave(
        &self,
        exchange: &Arc<Exchange>,
        point: InterceptPoint,
        filter: ContentFilter,
    ) -> Result<WaveOutcome, PipelineError> {
        let candidates = self.candidates(exchange, point, filter);
        if candidates.is_empty() {
            trace!(state = ?WaveState::Pending, "No interceptors registered");
            return Ok(WaveOutcome::skipped());
        }

        trace!(state = ?WaveState::Resolving, candidates = candidates.len());
        let applicable = match self.resolve_all(exchange, point, candidates).await {
            Ok(applicable) => applicable,
            Err(e) => {
                debug!(state = ?WaveState::Failed, error = %e, "Interceptor wave failed");
                return Err(e);
            }
        };

        if applicable.is_empty() {
            return Ok(WaveOutcome::skipped());
        }

        trace!(state = ?WaveState::Executing, applicable = applicable.len());
        let mut executed = Vec::with_capacity(applicable.len());
        for record in applicable {
            if let Err(e) = self.handle_one(exchange, point, &record).await {
                debug!(state = ?WaveState::Failed, error = %e, "Interceptor wave failed");
                return Err(e);
            }
            executed.push(record.name.clone());
        }

        Ok(WaveOutcome {
            state: WaveState::Completed,
            executed,
        })
    }

    fn candidates(
        &self,
        exchange: &Exchange,
        point: InterceptPoint,
        filter: ContentFilter,
    ) -> Vec<Arc<InterceptorRecord>> {
        let mut candidates = self.registry.candidates(exchange, point);

        if let Some(service) = self.registry.handling_service(exchange) {
            if service.descriptor.opts_out_of(point) {
                candidates.retain(|r| r.required);
            }
        }

        if filter == ContentFilter::ExcludeRequiringContent {
            candidates.retain(|r| !r.descriptor.requires_content);
        }

        candidates
    }

    async fn resolve_all(
        &self,
        exchange: &Exchange,
        point: InterceptPoint,
        candidates: Vec<Arc<InterceptorRecord>>,
    ) -> Result<Vec<Arc<InterceptorRecord>>, PipelineError> {
        let request = exchange.request().await;
        let response = exchange.response().await;

        let mut applicable = Vec::with_capacity(candidates.len());
        let mut first_error = None;

        for record in candidates {
            match record.instance.resolve(&request, &response).await {
                Ok(true) => applicable.push(record),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        interceptor = %record.name,
                        point = %point,
                        path = %request.path(),
                        error = %e,
                        "Error resolving interceptor"
                    );
                    exchange.set_in_error();
                    self.metrics.record_interceptor_error();
                    first_error.get_or_insert(PipelineError::InterceptorResolution {
                        interceptor: record.name.clone(),
                        point,
                        source: e,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(applicable),
        }
    }

    async fn handle_one(
        &self,
        exchange: &Exchange,
        point: InterceptPoint,
        record: &InterceptorRecord,
    ) -> Result<(), PipelineError> {
        let start = Instant::now();

        let result = {
            let mut request = exchange.request_mut().await;
            let mut response = exchange.response_mut().await;
            let result = record.instance.handle(&mut request, &mut response).await;
            if response.is_in_error() {
                exchange.set_in_error();
            }
            result
        };

        let elapsed = start.elapsed();
        self.metrics
            .record_interceptor_execution(elapsed, result.is_ok());

        match result {
            Ok(()) => {
                debug!(
                    interceptor = %record.name,
                    point = %point,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Executed interceptor"
                );
                Ok(())
            }
            Err(source) => {
                exchange.set_in_error();
                Err(PipelineError::InterceptorExecution {
                    interceptor: record.name.clone(),
                    point,
                    elapsed_ms: elapsed.as_millis() as u64,
                    source,
                })
            }
        }
    }

    /// Resolve the `RESPONSE_ASYNC` interceptors here and hand the applicable
    /// ones to the dispatcher, each with its own copy of the request and
    /// response taken while the views are read-locked. Resolution failures
    /// flag the exchange but never fail the response path.
    async fn dispatch_async(&self, exchange: &Arc<Exchange>, filter: ContentFilter) {
        let point = InterceptPoint::ResponseAsync;
        let candidates = self.candidates(exchange, point, filter);
        if candidates.is_empty() {
            return;
        }

        let applicable = {
            let request = exchange.request().await;
            let response = exchange.response().await;
            let mut applicable = Vec::with_capacity(candidates.len());
            for record in candidates {
                match record.instance.resolve(&request, &response).await {
                    Ok(true) => applicable.push((record, request.clone(), response.clone())),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            interceptor = %record.name,
                            point = %point,
                            error = %e,
                            "Error resolving interceptor"
                        );
                        exchange.set_in_error();
                        self.metrics.record_interceptor_error();
                    }
                }
            }
            applicable
        };

        for (record, request, response) in applicable {
            self.metrics.record_async_dispatch();
            self.dispatcher.submit(exchange.clone(), request, response, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryDownstream;
    use crate::exchange::{ContentKind, Request};
    use crate::interceptor::InterceptorError;
    use crate::plugin::ServiceRecord;
    use crate::routing::{PipelineInfo, PIPELINE_INFO};
    use crate::test_utils::{harness, Behavior, Recording, StaticService};
    use http::Method;

    fn request() -> Request {
        Request::new(Method::GET, "/api/items".parse().unwrap())
    }

    #[tokio::test]
    async fn test_priority_order() {
        let harness = harness();
        let recording = Recording::default();
        for (name, priority) in [("p1", 1), ("p10", 10), ("p5", 5)] {
            harness.registry.register_interceptor(
                InterceptorRecord::interceptor(name, InterceptPoint::Response, recording.interceptor(name))
                    .with_priority(priority),
            );
        }

        for _ in 0..3 {
            recording.clear();
            let exchange = harness.exchange(request(), MemoryDownstream::new());
            let outcome = harness
                .executor
                .execute(&exchange, InterceptPoint::Response, ContentFilter::All)
                .await
                .unwrap();

            assert_eq!(outcome.state, WaveState::Completed);
            assert_eq!(outcome.executed, vec!["p10", "p5", "p1"]);
            assert_eq!(recording.handled(), vec!["p10", "p5", "p1"]);
        }
    }

    #[tokio::test]
    async fn test_empty_wave_is_skipped() {
        let harness = harness();
        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let outcome = harness
            .executor
            .execute(&exchange, InterceptPoint::RequestBeforeAuth, ContentFilter::All)
            .await
            .unwrap();
        assert_eq!(outcome.state, WaveState::Skipped);

        let recording = Recording::default();
        harness.registry.register_interceptor(InterceptorRecord::interceptor(
            "never",
            InterceptPoint::RequestBeforeAuth,
            recording.interceptor_with("never", Behavior::DoesNotApply),
        ));
        let outcome = harness
            .executor
            .execute(&exchange, InterceptPoint::RequestBeforeAuth, ContentFilter::All)
            .await
            .unwrap();
        assert_eq!(outcome.state, WaveState::Skipped);
        assert!(recording.handled().is_empty());
    }

    #[tokio::test]
    async fn test_handle_error_stops_wave() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor(
                "thrower",
                InterceptPoint::Response,
                recording.interceptor_with("thrower", Behavior::FailHandle("boom")),
            )
            .with_priority(2),
        );
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor("after", InterceptPoint::Response, recording.interceptor("after"))
                .with_priority(1),
        );

        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let err = harness
            .executor
            .execute(&exchange, InterceptPoint::Response, ContentFilter::All)
            .await
            .unwrap_err();

        assert!(exchange.is_in_error());
        assert!(err.to_string().contains("boom"));
        match err {
            PipelineError::InterceptorExecution {
                interceptor, point, ..
            } => {
                assert_eq!(interceptor, "thrower");
                assert_eq!(point, InterceptPoint::Response);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(recording.handled(), vec!["thrower"]);
    }

    #[tokio::test]
    async fn test_resolve_error_fails_wave_after_resolving_others() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor(
                "broken",
                InterceptPoint::RequestAfterAuth,
                recording.interceptor_with("broken", Behavior::FailResolve("no predicate")),
            )
            .with_priority(5),
        );
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor(
                "fine",
                InterceptPoint::RequestAfterAuth,
                recording.interceptor("fine"),
            )
            .with_priority(1),
        );

        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let err = harness
            .executor
            .execute(&exchange, InterceptPoint::RequestAfterAuth, ContentFilter::All)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::InterceptorResolution { ref interceptor, .. } if interceptor == "broken"
        ));
        assert!(exchange.is_in_error());
        assert_eq!(recording.resolved(), vec!["broken", "fine"]);
        assert!(recording.handled().is_empty());
    }

    #[tokio::test]
    async fn test_required_interceptors_bypass_opt_out() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_service(
            ServiceRecord::service(
                "quiet",
                "/quiet",
                Arc::new(StaticService::json(serde_json::json!({}))),
            )
            .dont_intercept([InterceptPoint::RequestAfterAuth]),
        );
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor(
                "security",
                InterceptPoint::RequestAfterAuth,
                recording.interceptor("security"),
            )
            .with_kind(ContentKind::Json)
            .required(),
        );
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor(
                "decorator",
                InterceptPoint::RequestAfterAuth,
                recording.interceptor("decorator"),
            )
            .with_kind(ContentKind::Json),
        );

        let exchange = harness.exchange(
            Request::new(Method::GET, "/quiet".parse().unwrap()),
            MemoryDownstream::new(),
        );
        exchange.attach(
            PIPELINE_INFO,
            PipelineInfo::Service {
                name: "quiet".to_string(),
                uri: "/quiet".to_string(),
            },
        );

        let outcome = harness
            .executor
            .execute(&exchange, InterceptPoint::RequestAfterAuth, ContentFilter::All)
            .await
            .unwrap();
        assert_eq!(outcome.executed, vec!["security"]);
        assert_eq!(recording.handled(), vec!["security"]);
    }

    #[tokio::test]
    async fn test_response_interceptors_at_most_once() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_interceptor(InterceptorRecord::interceptor(
            "sync",
            InterceptPoint::Response,
            recording.interceptor("sync"),
        ));
        harness.registry.register_interceptor(InterceptorRecord::interceptor(
            "async",
            InterceptPoint::ResponseAsync,
            recording.interceptor("async"),
        ));

        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let first = harness
            .executor
            .execute_response_interceptors(&exchange, ContentFilter::All)
            .await
            .unwrap();
        let second = harness
            .executor
            .execute_response_interceptors(&exchange, ContentFilter::ExcludeRequiringContent)
            .await
            .unwrap();
        harness.dispatcher.wait_idle().await;

        assert!(first);
        assert!(!second);
        let mut handled = recording.handled();
        handled.sort();
        assert_eq!(handled, vec!["async", "sync"]);
    }

    #[tokio::test]
    async fn test_filter_excludes_content_interceptors() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_interceptor(
            InterceptorRecord::interceptor("reader", InterceptPoint::Response, recording.interceptor("reader"))
                .requiring_content(),
        );
        harness.registry.register_interceptor(InterceptorRecord::interceptor(
            "headers",
            InterceptPoint::Response,
            recording.interceptor("headers"),
        ));

        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let outcome = harness
            .executor
            .execute(&exchange, InterceptPoint::Response, ContentFilter::ExcludeRequiringContent)
            .await
            .unwrap();
        assert_eq!(outcome.executed, vec!["headers"]);
    }

    #[tokio::test]
    async fn test_response_marked_in_error_flags_exchange() {
        let harness = harness();
        let recording = Recording::default();
        harness.registry.register_interceptor(InterceptorRecord::interceptor(
            "deny",
            InterceptPoint::RequestAfterAuth,
            recording.interceptor_with("deny", Behavior::Reject(http::StatusCode::FORBIDDEN)),
        ));

        let exchange = harness.exchange(request(), MemoryDownstream::new());
        let outcome = harness
            .executor
            .execute(&exchange, InterceptPoint::RequestAfterAuth, ContentFilter::All)
            .await
            .unwrap();
        assert_eq!(outcome.state, WaveState::Completed);
        assert!(exchange.is_in_error());
    }

    #[test]
    fn test_error_source_is_kept() {
        let err = PipelineError::InterceptorResolution {
            interceptor: "x".to_string(),
            point: InterceptPoint::Response,
            source: InterceptorError::failed("bad"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
