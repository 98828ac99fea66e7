use super::event::ChangeEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The watch can be restarted after a backoff
    #[error("transient watch error: {0}")]
    Transient(String),

    #[error("fatal watch error: {0}")]
    Fatal(String),
}

pub type ChangeEventStream = BoxStream<'static, Result<ChangeEvent, WatchError>>;

/// Database side of change streams.
#[async_trait]
pub trait ChangeStreamSource: Send + Sync {
    /// Open a watch on `db.coll` filtered by the aggregation `stages`.
    async fn watch(&self, db: &str, coll: &str, stages: &[Value]) -> Result<ChangeEventStream, WatchError>;
}

type Channel = broadcast::Sender<Result<ChangeEvent, WatchError>>;

/// In-process change source. Events published for a collection reach every
/// watch open on it at that moment. Stages are not evaluated.
pub struct MemoryChangeSource {
    channels: DashMap<(String, String), Channel>,
    capacity: usize,
}

impl Default for MemoryChangeSource {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryChangeSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn channel(&self, db: &str, coll: &str) -> Channel {
        self.channels
            .entry((db.to_string(), coll.to_string()))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event; returns how many watches received it.
    pub fn publish(&self, db: &str, coll: &str, event: ChangeEvent) -> usize {
        self.channel(db, coll).send(Ok(event)).unwrap_or(0)
    }

    /// Deliver a watch error to every open watch on `db.coll`.
    pub fn fail(&self, db: &str, coll: &str, error: WatchError) -> usize {
        self.channel(db, coll).send(Err(error)).unwrap_or(0)
    }

    pub fn subscriber_count(&self, db: &str, coll: &str) -> usize {
        self.channels
            .get(&(db.to_string(), coll.to_string()))
            .map(|c| c.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChangeStreamSource for MemoryChangeSource {
    async fn watch(&self, db: &str, coll: &str, _stages: &[Value]) -> Result<ChangeEventStream, WatchError> {
        let receiver = self.channel(db, coll).subscribe();
        let stream = BroadcastStream::new(receiver).map(|item| match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(WatchError::Transient(format!(
                "watch lagged behind by {skipped} events"
            ))),
        });
        Ok(stream.boxed())
    }
}
