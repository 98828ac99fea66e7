use super::key::ChangeStreamWorkerKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("session closed")]
pub struct SessionClosed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Text(String),
}

/// Transport side of one client connection.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    async fn send(&self, message: SessionMessage) -> Result<(), SessionClosed>;

    /// Stop delivering; the transport closes the connection.
    fn close(&self);
}

/// Channel backed by a bounded mpsc queue drained by the transport.
/// Closing drops the sender, which ends the receiver.
pub struct MpscSessionChannel {
    tx: Mutex<Option<mpsc::Sender<SessionMessage>>>,
}

impl MpscSessionChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SessionMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl SessionChannel for MpscSessionChannel {
    async fn send(&self, message: SessionMessage) -> Result<(), SessionClosed> {
        let tx = self.tx.lock().clone().ok_or(SessionClosed)?;
        tx.send(message).await.map_err(|_| SessionClosed)
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// One client bound to a worker.
///
/// Events reach the client in the order they were queued: the worker
/// pushes rendered events into the session's outbox and a single delivery
/// task drains it into the channel.
pub struct ChangeStreamSession {
    id: Uuid,
    key: ChangeStreamWorkerKey,
    channel: Arc<dyn SessionChannel>,
    closed: AtomicBool,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ChangeStreamSession {
    pub fn new(key: ChangeStreamWorkerKey, channel: Arc<dyn SessionChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            key,
            channel,
            closed: AtomicBool::new(false),
            outbox: Mutex::new(Some(tx)),
            pending: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ChangeStreamWorkerKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send_text(&self, text: String) -> Result<(), SessionClosed> {
        if self.is_closed() {
            return Err(SessionClosed);
        }
        self.channel.send(SessionMessage::Text(text)).await
    }

    /// Queue an event for delivery without waiting on the client.
    pub fn enqueue(&self, text: String) -> Result<(), SessionClosed> {
        if self.is_closed() {
            return Err(SessionClosed);
        }
        let outbox = self.outbox.lock();
        let tx = outbox.as_ref().ok_or(SessionClosed)?;
        tx.send(text).map_err(|_| SessionClosed)
    }

    /// Hand the queued events to the delivery task. Only the first caller
    /// gets the receiver.
    pub(crate) fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.pending.lock().take()
    }

    /// Drain the outbox into the channel until the session closes or a
    /// send fails. Returns `true` if delivery stopped on a failed send.
    pub(crate) async fn deliver(&self, mut outbox: mpsc::UnboundedReceiver<String>) -> bool {
        while let Some(text) = outbox.recv().await {
            if self.send_text(text).await.is_err() {
                return !self.is_closed();
            }
        }
        false
    }

    /// Close the transport side. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbox.lock().take();
        self.pending.lock().take();
        self.channel.close();
        true
    }
}

impl std::fmt::Debug for ChangeStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}
