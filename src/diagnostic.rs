//! Per-request correlation context for logs
//!
//! The context (trace id plus echoed header values) lives in a task-local
//! slot. [`scope`] installs it for the duration of a future and drops it when
//! the future completes, so a task can never leak its context into the next
//! one. Code that hands work to another task takes a [`snapshot`] first and
//! runs the work inside a new `scope`.

use crate::exchange::AttachmentKey;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

pub const TRACE_ID: &str = "traceId";

pub const DIAGNOSTIC_CONTEXT: AttachmentKey<DiagnosticContext> =
    AttachmentKey::new("diagnostic-context");

tokio::task_local! {
    static CONTEXT: RefCell<DiagnosticContext>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticContext {
    entries: BTreeMap<String, String>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(TRACE_ID, trace_id);
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.get(TRACE_ID)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Span carrying the trace id, for work running on behalf of a request.
    pub fn span(&self, name: &'static str) -> tracing::Span {
        let trace_id = self.trace_id().unwrap_or("-");
        tracing::info_span!("diagnostic", task = name, trace_id = %trace_id)
    }
}

/// Run `fut` with `ctx` installed as the current context.
pub async fn scope<F: Future>(ctx: DiagnosticContext, fut: F) -> F::Output {
    CONTEXT.scope(RefCell::new(ctx), fut).await
}

/// Copy of the current context, empty outside of a [`scope`].
pub fn snapshot() -> DiagnosticContext {
    CONTEXT
        .try_with(|ctx| ctx.borrow().clone())
        .unwrap_or_default()
}

pub fn get(key: &str) -> Option<String> {
    CONTEXT
        .try_with(|ctx| ctx.borrow().get(key).map(str::to_owned))
        .ok()
        .flatten()
}

/// Set a value in the current context. Returns `false` outside of a [`scope`].
pub fn set(key: impl Into<String>, value: impl Into<String>) -> bool {
    let (key, value) = (key.into(), value.into());
    CONTEXT
        .try_with(|ctx| ctx.borrow_mut().insert(key, value))
        .is_ok()
}

pub fn clear() {
    let _ = CONTEXT.try_with(|ctx| *ctx.borrow_mut() = DiagnosticContext::default());
}
