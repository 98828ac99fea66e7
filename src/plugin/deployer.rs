//! Deploys script plugins from the plugin directory into the registry

use super::config::PluginConfig;
use super::record::{InterceptorRecord, PluginOrigin, PluginRecord, ServiceRecord};
use super::registry::PluginRegistry;
use crate::script::{PluginError, ScriptEngine, ScriptInterceptor, ScriptKind, ScriptModule, ScriptService};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of deploying a whole plugin directory.
#[derive(Debug, Default)]
pub struct DeployReport {
    pub deployed: Vec<String>,
    pub failed: Vec<(PathBuf, PluginError)>,
}

impl DeployReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct PluginDeployer {
    registry: Arc<PluginRegistry>,
    engine: Arc<dyn ScriptEngine>,
    config: PluginConfig,
    modules: DashMap<PathBuf, Arc<dyn ScriptModule>>,
}

/// Whether `path` names a script plugin file.
pub fn is_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("js") | Some("mjs")
    )
}

impl PluginDeployer {
    pub fn new(registry: Arc<PluginRegistry>, engine: Arc<dyn ScriptEngine>, config: PluginConfig) -> Self {
        Self {
            registry,
            engine,
            config,
            modules: DashMap::new(),
        }
    }

    pub fn deployed_count(&self) -> usize {
        self.modules.len()
    }

    /// Deploy every script in the plugin directory. A plugin that fails to
    /// deploy is reported and skipped; the others still deploy.
    pub async fn deploy_all(&self) -> Result<DeployReport, PluginError> {
        let Some(plugin_dir) = &self.config.plugin_dir else {
            return Ok(DeployReport::default());
        };

        let entries = std::fs::read_dir(plugin_dir).map_err(|e| {
            PluginError::config(format!(
                "Failed to read plugin directory {}: {e}",
                plugin_dir.display()
            ))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| PluginError::config(format!("Failed to read directory entry: {e}")))?;
            let path = entry.path();
            if path.is_file() && is_script(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut report = DeployReport::default();
        for path in paths {
            match self.deploy(&path).await {
                Ok(name) => report.deployed.push(name),
                Err(e) => report.failed.push((path, e)),
            }
        }

        info!(
            deployed = report.deployed.len(),
            failed = report.failed.len(),
            dir = %plugin_dir.display(),
            "Script plugins deployed"
        );
        Ok(report)
    }

    /// Deploy or redeploy the script at `path`. Returns the plugin name.
    ///
    /// Whatever was deployed from `path` before is undeployed first, also
    /// when the new version fails to evaluate.
    pub async fn deploy(&self, path: &Path) -> Result<String, PluginError> {
        self.undeploy(path).await;

        let module = match self.engine.evaluate(path).await {
            Ok(module) => module,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to deploy script plugin");
                return Err(e);
            }
        };

        let options = module.options().clone();
        let origin = PluginOrigin::Script(path.to_path_buf());

        match options.kind {
            ScriptKind::Interceptor => {
                let mut record = InterceptorRecord::interceptor(
                    options.name.clone(),
                    options.intercept_point,
                    Arc::new(ScriptInterceptor::new(module.clone())),
                )
                .with_kind(options.content_kind)
                .with_priority(options.priority)
                .with_description(options.description.clone())
                .with_origin(origin);
                if options.requires_content {
                    record = record.requiring_content();
                }
                if options.required {
                    record = record.required();
                }
                self.registry
                    .register_interceptor(self.apply_override(record));
            }
            ScriptKind::Service => {
                let mut record = ServiceRecord::service(
                    options.name.clone(),
                    options.service_uri(),
                    Arc::new(ScriptService::new(module.clone())),
                )
                .with_kind(options.content_kind)
                .with_description(options.description.clone())
                .with_origin(origin);
                if options.blocking {
                    record = record.blocking();
                }
                self.registry.register_service(self.apply_override(record));
            }
        }

        self.modules.insert(path.to_path_buf(), module);
        info!(plugin = %options.name, path = %path.display(), kind = ?options.kind, "Deployed script plugin");
        Ok(options.name)
    }

    /// Remove everything deployed from `path`.
    pub async fn undeploy(&self, path: &Path) -> usize {
        let removed = self
            .registry
            .unregister_origin(&PluginOrigin::Script(path.to_path_buf()));
        if let Some((_, module)) = self.modules.remove(path) {
            module.shutdown().await;
            info!(path = %path.display(), plugins = removed, "Undeployed script plugin");
        }
        removed
    }

    pub async fn shutdown(&self) {
        let paths: Vec<PathBuf> = self.modules.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.undeploy(&path).await;
        }
        self.engine.shutdown().await;
    }

    fn apply_override<T: ?Sized, D>(&self, mut record: PluginRecord<T, D>) -> PluginRecord<T, D> {
        let Some(over) = self.config.override_for(&record.name) else {
            return record;
        };

        if let Some(enabled) = over.enabled {
            if !enabled {
                warn!(plugin = %record.name, "Plugin disabled by configuration");
            }
            record.enabled = enabled;
        }
        if let Some(priority) = over.priority {
            record.priority = priority;
        }
        if let Some(required) = over.required {
            record.required = required;
        }
        record
    }
}
