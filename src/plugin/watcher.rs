//! Plugin directory watcher for hot deploy.

use super::deployer::{is_script, PluginDeployer};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Watches the plugin directory and reports script file changes.
pub struct PluginWatcher {
    dir: PathBuf,
    events_tx: mpsc::UnboundedSender<PluginEvent>,
}

impl PluginWatcher {
    /// Returns the watcher and a receiver for plugin file events.
    pub fn new(dir: &Path) -> (Self, mpsc::UnboundedReceiver<PluginEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                dir: dir.to_path_buf(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.events_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                        return;
                    }
                    for path in event.paths.into_iter().filter(|p| is_script(p)) {
                        let event = if path.exists() {
                            PluginEvent::Changed(path)
                        } else {
                            PluginEvent::Removed(path)
                        };
                        let _ = tx.send(event);
                    }
                }
                Err(e) => tracing::error!("Plugin watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = ?self.dir, "Plugin hot deploy watcher started");
        Ok(watcher)
    }
}

/// Apply plugin file events to `deployer` until the sender side closes.
pub fn spawn_hot_deploy(
    deployer: Arc<PluginDeployer>,
    mut events: mpsc::UnboundedReceiver<PluginEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PluginEvent::Changed(path) => {
                    tracing::info!(path = %path.display(), "Plugin change detected, redeploying");
                    // Failures are logged by the deployer; the previous version is gone
                    let _ = deployer.deploy(&path).await;
                }
                PluginEvent::Removed(path) => {
                    deployer.undeploy(&path).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginConfig, PluginRegistry};
    use crate::script::{PluginError, ScriptEngine, ScriptModule};
    use async_trait::async_trait;

    struct RejectingEngine;

    #[async_trait]
    impl ScriptEngine for RejectingEngine {
        async fn evaluate(&self, _path: &Path) -> Result<Arc<dyn ScriptModule>, PluginError> {
            Err(PluginError::config("rejected"))
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_hot_deploy_loop_ends_with_sender() {
        let registry = Arc::new(PluginRegistry::new());
        let deployer = Arc::new(PluginDeployer::new(
            registry,
            Arc::new(RejectingEngine),
            PluginConfig::default(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_hot_deploy(deployer, rx);
        tx.send(PluginEvent::Changed(PathBuf::from("/plugins/a.js"))).unwrap();
        tx.send(PluginEvent::Removed(PathBuf::from("/plugins/a.js"))).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_reports_new_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let (watcher, mut rx) = PluginWatcher::new(dir.path());
        let _guard = watcher.run().unwrap();

        let path = dir.path().join("audit.js");
        std::fs::write(&path, "module.exports = {}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            PluginEvent::Changed(changed) => assert_eq!(changed.file_name(), path.file_name()),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
