use super::key::ChangeStreamWorkerKey;
use super::session::{ChangeStreamSession, SessionChannel};
use super::source::ChangeStreamSource;
use super::worker::ChangeStreamWorker;
use crate::metrics::Metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

/// A session attached to a worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<ChangeStreamSession>,
    worker: Arc<ChangeStreamWorker>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn worker(&self) -> &Arc<ChangeStreamWorker> {
        &self.worker
    }

    /// Detach from the worker, interrupting it if this was its last session.
    pub fn close(&self) {
        self.worker.close_session(self.session.id());
    }
}

/// Live change-stream workers, at most one per key.
pub struct ChangeStreamWorkers {
    workers: DashMap<ChangeStreamWorkerKey, Arc<ChangeStreamWorker>>,
    source: Arc<dyn ChangeStreamSource>,
    backoff: Duration,
    metrics: Arc<Metrics>,
    tracker: TaskTracker,
}

impl ChangeStreamWorkers {
    pub fn new(source: Arc<dyn ChangeStreamSource>, backoff: Duration, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            source,
            backoff,
            metrics,
            tracker: TaskTracker::new(),
        })
    }

    pub fn get(&self, key: &ChangeStreamWorkerKey) -> Option<Arc<ChangeStreamWorker>> {
        self.workers.get(key).map(|w| w.value().clone())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker for `key`, created and started if there is none. A worker
    /// that is stopping or terminated but has not deregistered yet is
    /// replaced; its exit only removes its own entry.
    pub fn get_or_create(
        self: &Arc<Self>,
        key: &ChangeStreamWorkerKey,
        stages: &[Value],
        db: &str,
        coll: &str,
    ) -> Arc<ChangeStreamWorker> {
        let fresh = || {
            ChangeStreamWorker::new(
                key.clone(),
                stages.to_vec(),
                db,
                coll,
                self.metrics.clone(),
            )
        };

        let (worker, created) = match self.workers.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().is_retiring() => (entry.get().clone(), false),
            Entry::Occupied(mut entry) => {
                let worker = fresh();
                entry.insert(worker.clone());
                (worker, true)
            }
            Entry::Vacant(entry) => {
                let worker = fresh();
                entry.insert(worker.clone());
                (worker, true)
            }
        };

        if created {
            self.start(worker.clone());
        }
        worker
    }

    /// Attach a session for `key`, creating the worker when needed.
    pub fn attach(
        self: &Arc<Self>,
        key: &ChangeStreamWorkerKey,
        stages: &[Value],
        db: &str,
        coll: &str,
        channel: Arc<dyn SessionChannel>,
    ) -> SessionHandle {
        let session = Arc::new(ChangeStreamSession::new(key.clone(), channel));
        loop {
            let worker = self.get_or_create(key, stages, db, coll);
            // The worker may have terminated since the lookup
            if worker.add_session(session.clone()) {
                debug!(worker = %key, session = %session.id(), "Change stream session attached");
                return SessionHandle { session, worker };
            }
        }
    }

    /// Interrupt the workers streaming from `db`, or only from `db.coll`.
    /// Their sessions are closed as the workers exit.
    pub fn close_matching(&self, db: &str, coll: Option<&str>) -> usize {
        let matching: Vec<Arc<ChangeStreamWorker>> = self
            .workers
            .iter()
            .filter(|w| w.db() == db && coll.map_or(true, |c| w.coll() == c))
            .map(|w| w.value().clone())
            .collect();

        for worker in &matching {
            info!(worker = %worker.key(), "Closing change stream worker of a modified collection");
            worker.interrupt();
        }
        matching.len()
    }

    /// Interrupt every worker and wait for all of them to exit.
    pub async fn shutdown(&self) {
        for worker in self.workers.iter() {
            worker.interrupt();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn start(self: &Arc<Self>, worker: Arc<ChangeStreamWorker>) {
        self.metrics.worker_started();
        let registry = Arc::clone(self);
        let source = self.source.clone();
        let backoff = self.backoff;
        let span = tracing::info_span!("change_stream_worker", key = %worker.key());

        self.tracker.spawn(
            async move {
                let exit = worker.clone().run(source, backoff).await;
                worker.terminate(exit);
                registry
                    .workers
                    .remove_if(worker.key(), |_, current| Arc::ptr_eq(current, &worker));
                registry.metrics.worker_stopped();
                debug!(state = ?exit, "Change stream worker exited");
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changestream::{ChangeEvent, JsonMode, MemoryChangeSource, MpscSessionChannel, WorkerState};
    use serde_json::json;

    fn key(name: &str) -> ChangeStreamWorkerKey {
        ChangeStreamWorkerKey::new(&format!("/db/coll/_streams/{name}"), json!({}), JsonMode::Relaxed)
    }

    fn setup() -> (Arc<MemoryChangeSource>, Arc<ChangeStreamWorkers>, Arc<Metrics>) {
        let source = Arc::new(MemoryChangeSource::default());
        let metrics = Arc::new(Metrics::new());
        let workers = ChangeStreamWorkers::new(source.clone(), Duration::from_millis(20), metrics.clone());
        (source, workers, metrics)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_worker() {
        let (_source, workers, metrics) = setup();
        let a = workers.get_or_create(&key("all"), &[], "db", "coll");
        let b = workers.get_or_create(&key("all"), &[], "db", "coll");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(workers.len(), 1);
        assert_eq!(metrics.change_stream_workers.get(), 1);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_without_sessions_reclaims_worker() {
        let (source, workers, metrics) = setup();
        let worker = workers.get_or_create(&key("all"), &[], "db", "coll");
        eventually(|| source.subscriber_count("db", "coll") == 1).await;

        source.publish("db", "coll", ChangeEvent::delete(json!(1)));
        eventually(|| workers.is_empty()).await;

        assert_eq!(worker.state(), WorkerState::ClosedNoSessions);
        assert_eq!(metrics.change_stream_workers.get(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_restarts_watch() {
        let (source, workers, metrics) = setup();
        let (channel, mut rx) = MpscSessionChannel::new(8);
        let handle = workers.attach(&key("all"), &[], "db", "coll", Arc::new(channel));
        eventually(|| source.subscriber_count("db", "coll") == 1).await;

        source.fail("db", "coll", crate::changestream::WatchError::Transient("primary stepped down".into()));
        eventually(|| metrics.change_stream_reconnects_total.get() == 1).await;
        eventually(|| source.subscriber_count("db", "coll") == 1 && handle.worker().state() == WorkerState::Watching).await;

        source.publish("db", "coll", ChangeEvent::delete(json!(7)));
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(message, crate::changestream::SessionMessage::Text(text) if text.contains("delete")));

        handle.close();
        eventually(|| workers.is_empty()).await;
    }

    #[tokio::test]
    async fn test_fatal_error_closes_sessions() {
        let (source, workers, _metrics) = setup();
        let (channel, mut rx) = MpscSessionChannel::new(8);
        let handle = workers.attach(&key("all"), &[], "db", "coll", Arc::new(channel));
        eventually(|| source.subscriber_count("db", "coll") == 1).await;

        source.fail("db", "coll", crate::changestream::WatchError::Fatal("collection dropped".into()));
        eventually(|| workers.is_empty()).await;

        assert_eq!(handle.worker().state(), WorkerState::ClosedFatal);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reattach_after_last_close_gets_fresh_worker() {
        let (source, workers, _metrics) = setup();
        let (first, _first_rx) = MpscSessionChannel::new(8);
        let h1 = workers.attach(&key("all"), &[], "db", "coll", Arc::new(first));
        h1.close();

        let (second, mut rx) = MpscSessionChannel::new(8);
        let h2 = workers.attach(&key("all"), &[], "db", "coll", Arc::new(second));
        assert!(!Arc::ptr_eq(h1.worker(), h2.worker()));
        assert!(Arc::ptr_eq(&workers.get(&key("all")).unwrap(), h2.worker()));

        eventually(|| h1.worker().is_terminated()).await;
        eventually(|| h2.worker().state() == WorkerState::Watching).await;
        assert_eq!(workers.len(), 1);

        source.publish("db", "coll", ChangeEvent::delete(json!(3)));
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(message, Some(crate::changestream::SessionMessage::Text(text)) if text.contains("delete")));

        h2.close();
        eventually(|| workers.is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_receives_events_in_order() {
        let (source, workers, _metrics) = setup();
        let (channel, mut rx) = MpscSessionChannel::new(1);
        let handle = workers.attach(&key("all"), &[], "db", "coll", Arc::new(channel));
        eventually(|| handle.worker().state() == WorkerState::Watching).await;

        for i in 0..200 {
            source.publish("db", "coll", ChangeEvent::delete(json!(i)));
        }

        for expected in 0..200 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
            let Some(crate::changestream::SessionMessage::Text(text)) = message else {
                panic!("session closed early");
            };
            let event: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(event["documentKey"]["_id"], json!(expected));
        }

        handle.close();
        eventually(|| workers.is_empty()).await;
    }

    #[tokio::test]
    async fn test_close_matching_interrupts_collection_workers() {
        let (_source, workers, _metrics) = setup();
        workers.get_or_create(&key("a"), &[], "db", "coll");
        workers.get_or_create(&key("b"), &[], "db", "other");

        assert_eq!(workers.close_matching("db", Some("coll")), 1);
        eventually(|| workers.len() == 1).await;
        assert_eq!(workers.close_matching("db", None), 1);
        eventually(|| workers.is_empty()).await;
    }
}
