use super::event::ChangeEvent;
use super::key::ChangeStreamWorkerKey;
use super::session::ChangeStreamSession;
use super::source::{ChangeStreamSource, WatchError};
use crate::metrics::Metrics;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Watching,
    Reconnecting,
    /// An event arrived and nobody was listening
    ClosedNoSessions,
    ClosedFatal,
    Interrupted,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ClosedNoSessions | Self::ClosedFatal | Self::Interrupted
        )
    }
}

/// Why the watch loop ended or needs to restart.
enum Watch {
    Exit(WorkerState),
    Restart(String),
}

/// Watches one collection and fans events out to the sessions sharing a key.
pub struct ChangeStreamWorker {
    key: ChangeStreamWorkerKey,
    db: String,
    coll: String,
    stages: Vec<Value>,
    sessions: DashMap<Uuid, Arc<ChangeStreamSession>>,
    state: Mutex<WorkerState>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl ChangeStreamWorker {
    pub fn new(
        key: ChangeStreamWorkerKey,
        stages: Vec<Value>,
        db: impl Into<String>,
        coll: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            db: db.into(),
            coll: coll.into(),
            stages,
            sessions: DashMap::new(),
            state: Mutex::new(WorkerState::Created),
            cancel: CancellationToken::new(),
            metrics,
        })
    }

    pub fn key(&self) -> &ChangeStreamWorkerKey {
        &self.key
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    pub fn stages(&self) -> &[Value] {
        &self.stages
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the worker terminated or was told to stop. A retiring worker
    /// takes no new sessions.
    pub fn is_retiring(&self) -> bool {
        self.is_terminated() || self.cancel.is_cancelled()
    }

    /// Add a session unless the worker terminated or is stopping, and start
    /// its delivery task.
    pub fn add_session(self: &Arc<Self>, session: Arc<ChangeStreamSession>) -> bool {
        {
            let state = self.state.lock();
            if state.is_terminal() || self.cancel.is_cancelled() {
                return false;
            }
            self.sessions.insert(session.id(), session.clone());
        }
        self.metrics.session_attached();

        if let Some(outbox) = session.take_outbox() {
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                if session.deliver(outbox).await {
                    worker.close_session(session.id());
                }
            });
        }
        true
    }

    /// Remove and close a session. The last one leaving interrupts the worker.
    pub fn close_session(&self, id: Uuid) {
        let state = self.state.lock();
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };
        session.close();
        self.metrics.session_detached();
        debug!(worker = %self.key, session = %id, "Change stream session closed");

        if self.sessions.is_empty() && !state.is_terminal() {
            debug!(worker = %self.key, "Last session closed, interrupting worker");
            self.cancel.cancel();
        }
    }

    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Enter a terminal state and close every remaining session.
    pub(crate) fn terminate(&self, exit: WorkerState) {
        let sessions: Vec<Arc<ChangeStreamSession>> = {
            let mut state = self.state.lock();
            *state = exit;
            let ids: Vec<Uuid> = self.sessions.iter().map(|s| *s.key()).collect();
            ids.into_iter()
                .filter_map(|id| self.sessions.remove(&id).map(|(_, s)| s))
                .collect()
        };

        for session in sessions {
            session.close();
            self.metrics.session_detached();
        }
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Watch until the worker terminates. Transient errors restart the
    /// watch after `backoff`, for as long as it takes.
    pub async fn run(self: Arc<Self>, source: Arc<dyn ChangeStreamSource>, backoff: Duration) -> WorkerState {
        loop {
            let reason = match self.watch_once(source.as_ref()).await {
                Watch::Exit(exit) => return exit,
                Watch::Restart(reason) => reason,
            };

            self.set_state(WorkerState::Reconnecting);
            self.metrics.record_reconnect();
            warn!(
                worker = %self.key,
                error = %reason,
                backoff_ms = backoff.as_millis() as u64,
                "Change stream interrupted, restarting"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return WorkerState::Interrupted,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn watch_once(self: &Arc<Self>, source: &dyn ChangeStreamSource) -> Watch {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Watch::Exit(WorkerState::Interrupted),
            opened = source.watch(&self.db, &self.coll, &self.stages) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(WatchError::Transient(reason)) => return Watch::Restart(reason),
            Err(WatchError::Fatal(reason)) => {
                error!(worker = %self.key, error = %reason, "Change stream worker died");
                return Watch::Exit(WorkerState::ClosedFatal);
            }
        };

        self.set_state(WorkerState::Watching);
        debug!(worker = %self.key, "Change stream worker started listening for change events");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Watch::Exit(WorkerState::Interrupted),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if self.sessions.is_empty() {
                        debug!(worker = %self.key, "Closing change stream worker with no sessions");
                        return Watch::Exit(WorkerState::ClosedNoSessions);
                    }
                    self.dispatch(&event);
                }
                Some(Err(WatchError::Transient(reason))) => return Watch::Restart(reason),
                Some(Err(WatchError::Fatal(reason))) => {
                    error!(worker = %self.key, error = %reason, "Change stream worker died");
                    return Watch::Exit(WorkerState::ClosedFatal);
                }
                None => return Watch::Restart("change stream ended".to_string()),
            }
        }
    }

    /// Queue the event on every session; each session's delivery task sends
    /// in order, so a slow client only delays itself.
    fn dispatch(&self, event: &ChangeEvent) {
        self.metrics.record_change_event();
        let message = event.render(self.key.mode());

        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            if session.enqueue(message.clone()).is_err() {
                self.close_session(session.id());
            }
        }
    }
}

impl std::fmt::Debug for ChangeStreamWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamWorker")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}
