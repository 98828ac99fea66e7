//! Change streams: live database change events pushed to WebSocket clients
//!
//! Clients asking for the same stream with the same variables and output
//! mode share one [`ChangeStreamWorker`], keyed by [`ChangeStreamWorkerKey`].
//! The worker watches the collection through a [`ChangeStreamSource`] and
//! fans every event out to its sessions. It stops when its last session
//! closes, on a fatal watch error, or when interrupted, and always removes
//! itself from the [`ChangeStreamWorkers`] registry on the way out.

mod catalog;
mod event;
mod key;
mod registry;
mod remover;
mod session;
mod source;
mod worker;

pub use catalog::{parse_stream_path, resolve_stages, ResolvedStream, StreamCatalog, StreamPath};
pub use event::{ChangeEvent, UpdateDescription};
pub use key::{ChangeStreamWorkerKey, JsonMode};
pub use registry::{ChangeStreamWorkers, SessionHandle};
pub use remover::ObsoleteChangeStreamRemover;
pub use session::{ChangeStreamSession, MpscSessionChannel, SessionChannel, SessionClosed, SessionMessage};
pub use source::{ChangeEventStream, ChangeStreamSource, MemoryChangeSource, WatchError};
pub use worker::{ChangeStreamWorker, WorkerState};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChangeStreamError {
    #[error("Stream {0} does not exist")]
    StreamNotFound(String),

    #[error("Variable {0} not bound in the avars query parameter")]
    VariableNotBound(String),

    #[error("Invalid avars: {0}")]
    InvalidVariables(String),

    #[error("Invalid stream definition: {0}")]
    InvalidDefinition(String),

    #[error("The stream connection requires WebSocket, no 'Upgrade' or 'Connection' request header found")]
    NotWebSocket,

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
}

impl ChangeStreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::StreamNotFound(_) => StatusCode::NOT_FOUND,
            Self::VariableNotBound(_) | Self::InvalidVariables(_) | Self::NotWebSocket => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidDefinition(_) | Self::Watch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A stream a collection exposes at `/{db}/{coll}/_streams/{uri}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStreamDefinition {
    pub db: String,
    pub coll: String,
    pub uri: String,
    /// Aggregation stages, possibly with `$var` and `$ifvar` placeholders
    #[serde(default)]
    pub stages: Vec<Value>,
}
