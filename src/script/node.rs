//! Node.js script engine with concurrency control and timeouts

use super::process::ProcessPool;
use super::schema::{ScriptCall, ScriptOp, ScriptOptions, ScriptReply};
use super::{PluginError, ScriptEngine, ScriptModule};
use crate::plugin::PluginConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn, Instrument};

/// Evaluates plugin files in pooled Node.js processes.
///
/// One process pool exists per evaluated file. All modules share a single
/// semaphore bounding concurrent invocations.
pub struct NodeScriptEngine {
    config: PluginConfig,
    semaphore: Arc<Semaphore>,
    pools: DashMap<PathBuf, Arc<ProcessPool>>,
}

impl NodeScriptEngine {
    pub fn new(config: PluginConfig) -> Self {
        let max_concurrent = config.max_concurrent_executions as usize;
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            pools: DashMap::new(),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    async fn replace_pool(&self, path: &Path) -> Arc<ProcessPool> {
        let pool = Arc::new(ProcessPool::new(
            self.config.node_executable.clone(),
            path.to_path_buf(),
            self.config.pool_size_per_plugin as usize,
        ));

        // A redeploy must not keep processes that loaded the old source
        if let Some(previous) = self.pools.insert(path.to_path_buf(), pool.clone()) {
            previous.shutdown().await;
        }
        pool
    }
}

#[async_trait]
impl ScriptEngine for NodeScriptEngine {
    async fn evaluate(&self, path: &Path) -> Result<Arc<dyn ScriptModule>, PluginError> {
        let pool = self.replace_pool(path).await;
        let label = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin")
            .to_string();

        let reply = invoke_pooled(
            &pool,
            &self.semaphore,
            self.config.default_timeout_ms,
            &label,
            ScriptCall::options(),
        )
        .await?;
        let options = reply.options.ok_or_else(|| {
            PluginError::config(format!("{} does not export options", path.display()))
        })?;
        options.validate()?;

        debug!(
            plugin = %options.name,
            path = %path.display(),
            point = %options.intercept_point,
            "Evaluated script plugin"
        );

        let timeout_ms = self.config.plugin_timeout(&options.name);
        Ok(Arc::new(NodeScriptModule {
            path: path.to_path_buf(),
            options,
            pool,
            semaphore: self.semaphore.clone(),
            timeout_ms,
        }))
    }

    async fn shutdown(&self) {
        let pools: Vec<Arc<ProcessPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

/// A plugin file evaluated by [`NodeScriptEngine`]
pub struct NodeScriptModule {
    path: PathBuf,
    options: ScriptOptions,
    pool: Arc<ProcessPool>,
    semaphore: Arc<Semaphore>,
    timeout_ms: u64,
}

#[async_trait]
impl ScriptModule for NodeScriptModule {
    fn options(&self) -> &ScriptOptions {
        &self.options
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn invoke(&self, call: ScriptCall) -> Result<ScriptReply, PluginError> {
        invoke_pooled(
            &self.pool,
            &self.semaphore,
            self.timeout_ms,
            &self.options.name,
            call,
        )
        .await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Run one call on a pooled process with concurrency control and timeout
async fn invoke_pooled(
    pool: &ProcessPool,
    semaphore: &Semaphore,
    timeout_ms: u64,
    plugin: &str,
    call: ScriptCall,
) -> Result<ScriptReply, PluginError> {
    let start = Instant::now();
    let op = call.op;

    let span = tracing::debug_span!("script_invocation", plugin = %plugin, op = ?op);
    async move {
        // Acquire semaphore permit (blocks if at max concurrency)
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| PluginError::PoolExhausted)?;

        let mut process = pool.acquire().await?;

        match timeout(Duration::from_millis(timeout_ms), process.call(&call)).await {
            Ok(Ok(reply)) => {
                // A failed reply still leaves the process usable
                pool.release(process).await;
                let elapsed_ms = start.elapsed().as_millis() as u64;
                if op == ScriptOp::Options {
                    info!(elapsed_ms, path = %pool.plugin_path().display(), "Script options loaded");
                } else {
                    debug!(elapsed_ms, ok = reply.ok, "Script invocation finished");
                }
                reply.into_result()
            }
            Ok(Err(e)) => {
                let _ = process.kill().await;
                warn!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Script invocation failed"
                );
                Err(e)
            }
            Err(_) => {
                let _ = process.kill().await;
                warn!(timeout_ms, "Script invocation timed out");
                Err(PluginError::Timeout { timeout_ms })
            }
        }
    }
    .instrument(span)
    .await
}
