//! JavaScript plugins executed in Node.js
//!
//! Script plugins run in isolated Node.js processes and talk to the gateway
//! over stdin/stdout, one JSON message per line. The gateway only depends on
//! the [`ScriptEngine`] and [`ScriptModule`] traits; [`NodeScriptEngine`] is
//! the implementation shipped with the crate.
//!
//! # Modules
//!
//! - `schema`: wire messages and plugin options
//! - `process`: Node.js process spawning and pooling
//! - `node`: the Node.js engine, concurrency control and timeouts
//! - `interceptor` / `service`: adapters from a module to the plugin traits

mod interceptor;
mod node;
mod process;
mod schema;
mod service;

pub use interceptor::ScriptInterceptor;
pub use node::{NodeScriptEngine, NodeScriptModule};
pub use process::{PluginProcess, ProcessPool};
pub use schema::{ScriptCall, ScriptKind, ScriptOp, ScriptOptions, ScriptReply, WireRequest, WireResponse};
pub use service::ScriptService;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Script plugin errors
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin process timed out
    #[error("Plugin timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Plugin process failed to spawn
    #[error("Failed to spawn plugin process: {reason}")]
    SpawnFailed { reason: String },

    /// Plugin returned invalid JSON output
    #[error("Plugin returned invalid JSON: {reason}")]
    InvalidOutput { reason: String },

    /// Plugin I/O error (stdin/stdout)
    #[error("Plugin I/O error: {reason}")]
    IoError { reason: String },

    /// Plugin options are missing or invalid
    #[error("Plugin configuration error: {reason}")]
    ConfigError { reason: String },

    /// A module the plugin imports could not be found
    #[error("Plugin dependency '{module}' could not be loaded: {reason}")]
    MissingModule { module: String, reason: String },

    /// The plugin's own code threw
    #[error("Plugin error: {message}")]
    ScriptFailed { message: String },

    /// Semaphore acquisition failed (engine shut down)
    #[error("Plugin execution pool exhausted")]
    PoolExhausted,
}

impl PluginError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    pub fn missing_dependency(&self) -> Option<String> {
        match self {
            Self::MissingModule { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Map an error message reported by the host runner. Module resolution
    /// failures are told apart from ordinary script errors.
    pub fn from_script_message(message: &str) -> Self {
        match missing_module_name(message) {
            Some(module) => Self::MissingModule {
                module,
                reason: message.to_string(),
            },
            None => Self::ScriptFailed {
                message: message.to_string(),
            },
        }
    }
}

fn missing_module_name(message: &str) -> Option<String> {
    let rest = message
        .split_once("Cannot find module ")
        .or_else(|| message.split_once("Cannot find package "))?
        .1;
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let name = rest[1..].split(quote).next()?;
    Some(name.to_string())
}

/// Evaluates plugin sources into callable modules.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Load the plugin at `path` and validate its options.
    async fn evaluate(&self, path: &Path) -> Result<Arc<dyn ScriptModule>, PluginError>;

    async fn shutdown(&self);
}

/// An evaluated plugin.
#[async_trait]
pub trait ScriptModule: Send + Sync {
    fn options(&self) -> &ScriptOptions;

    fn path(&self) -> &Path;

    /// Call one of the module's exports.
    async fn invoke(&self, call: ScriptCall) -> Result<ScriptReply, PluginError>;

    async fn shutdown(&self);
}
