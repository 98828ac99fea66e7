use crate::diagnostic::{self, DiagnosticContext, DIAGNOSTIC_CONTEXT};
use crate::exchange::{Exchange, Request, Response};
use crate::plugin::InterceptorRecord;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, Instrument};

/// Runs `RESPONSE_ASYNC` interceptors off the response path.
///
/// Tasks are fire-and-forget: the response does not wait for them, and a
/// failure only flags the exchange. Each task works on its own copy of the
/// request and response, never on the exchange's live views. Concurrency
/// is bounded by a semaphore.
pub struct AsyncDispatcher {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl AsyncDispatcher {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Hand `record` off for execution against copies of the exchange's
    /// request and response. The diagnostic context is captured now and
    /// restored on the task.
    pub fn submit(
        &self,
        exchange: Arc<Exchange>,
        request: Request,
        response: Response,
        record: Arc<InterceptorRecord>,
    ) {
        let mut ctx = diagnostic::snapshot();
        if ctx.is_empty() {
            if let Some(attached) = exchange.attachment(DIAGNOSTIC_CONTEXT) {
                ctx = DiagnosticContext::clone(&attached);
            }
        }

        let span = ctx.span("async_interceptor");
        let permits = self.permits.clone();

        self.tracker.spawn(
            diagnostic::scope(ctx, async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                run(exchange, request, response, record).await;
            })
            .instrument(span),
        );
    }

    /// Tasks submitted and not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting permits and wait for running tasks.
    pub async fn shutdown(&self) {
        self.permits.close();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run(
    exchange: Arc<Exchange>,
    mut request: Request,
    mut response: Response,
    record: Arc<InterceptorRecord>,
) {
    let start = Instant::now();
    let result = record.instance.handle(&mut request, &mut response).await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => debug!(
            interceptor = %record.name,
            elapsed_ms,
            "Executed async interceptor"
        ),
        Err(e) => {
            exchange.set_in_error();
            error!(
                interceptor = %record.name,
                point = %record.descriptor.point,
                elapsed_ms,
                error = %e,
                "Error executing async interceptor"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryDownstream;
    use crate::diagnostic::TRACE_ID;
    use crate::interceptor::InterceptPoint;
    use crate::test_utils::{harness, Behavior, Recording};
    use http::Method;

    async fn submit(dispatcher: &AsyncDispatcher, exchange: &Arc<Exchange>, record: Arc<InterceptorRecord>) {
        let request = exchange.request().await.clone();
        let response = exchange.response().await.clone();
        dispatcher.submit(exchange.clone(), request, response, record);
    }

    #[tokio::test]
    async fn test_context_restored_on_task() {
        let harness = harness();
        let recording = Recording::default();
        let record = Arc::new(InterceptorRecord::interceptor(
            "audit",
            InterceptPoint::ResponseAsync,
            recording.interceptor_with("audit", Behavior::CaptureTraceId),
        ));

        let exchange = harness.exchange(
            Request::new(Method::GET, "/x".parse().unwrap()),
            MemoryDownstream::new(),
        );

        diagnostic::scope(DiagnosticContext::with_trace_id("t-42"), async {
            submit(&harness.dispatcher, &exchange, record.clone()).await;
        })
        .await;
        harness.dispatcher.wait_idle().await;

        assert_eq!(recording.trace_ids(), vec!["t-42".to_string()]);
        assert!(diagnostic::get(TRACE_ID).is_none());
    }

    #[tokio::test]
    async fn test_failure_flags_exchange() {
        let harness = harness();
        let recording = Recording::default();
        let record = Arc::new(InterceptorRecord::interceptor(
            "flaky",
            InterceptPoint::ResponseAsync,
            recording.interceptor_with("flaky", Behavior::FailHandle("late")),
        ));

        let exchange = harness.exchange(
            Request::new(Method::GET, "/x".parse().unwrap()),
            MemoryDownstream::new(),
        );
        submit(&harness.dispatcher, &exchange, record).await;
        harness.dispatcher.wait_idle().await;

        assert!(exchange.is_in_error());
        assert_eq!(harness.dispatcher.in_flight(), 0);
    }
}
