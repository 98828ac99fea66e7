//! Plugin configuration types and parsing
//!
//! This module defines configuration structures for script plugins and the
//! per-plugin overrides operators can apply on top of what a script declares.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Global plugin system configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Directory containing plugin .js/.mjs files (scripts are disabled when unset)
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,

    /// Path to Node.js executable (default: "node")
    #[serde(default = "default_node_executable")]
    pub node_executable: PathBuf,

    /// Maximum concurrent script invocations (global semaphore limit)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: u32,

    /// Number of warm processes to maintain per plugin
    #[serde(default = "default_pool_size")]
    pub pool_size_per_plugin: u32,

    /// Default timeout for a single script invocation (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Redeploy scripts when files in `plugin_dir` change
    #[serde(default)]
    pub hot_deploy: bool,

    /// Operator overrides keyed by plugin name
    #[serde(default)]
    pub overrides: HashMap<String, PluginOverride>,
}

/// Operator override applied to a deployed plugin
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Execution priority (higher runs first)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Keep running even when the handling service opts out of the point
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// Override default timeout for this plugin (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_node_executable() -> PathBuf {
    PathBuf::from("node")
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_pool_size() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    30000 // 30 seconds
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            node_executable: default_node_executable(),
            max_concurrent_executions: default_max_concurrent(),
            pool_size_per_plugin: default_pool_size(),
            default_timeout_ms: default_timeout_ms(),
            hot_deploy: false,
            overrides: HashMap::new(),
        }
    }
}

impl PluginConfig {
    /// Validate plugin configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(plugin_dir) = &self.plugin_dir {
            if !plugin_dir.exists() {
                return Err(format!(
                    "Plugin directory does not exist: {}",
                    plugin_dir.display()
                ));
            }

            if !plugin_dir.is_dir() {
                return Err(format!(
                    "Plugin directory path is not a directory: {}",
                    plugin_dir.display()
                ));
            }
        }

        if self.max_concurrent_executions == 0 {
            return Err("max_concurrent_executions must be greater than 0".to_string());
        }

        if self.max_concurrent_executions > 100 {
            return Err("max_concurrent_executions cannot exceed 100".to_string());
        }

        if self.pool_size_per_plugin > self.max_concurrent_executions {
            return Err(format!(
                "pool_size_per_plugin ({}) cannot exceed max_concurrent_executions ({})",
                self.pool_size_per_plugin, self.max_concurrent_executions
            ));
        }

        validate_timeout("default_timeout_ms", self.default_timeout_ms)?;

        for (name, plugin) in &self.overrides {
            if let Some(timeout_ms) = plugin.timeout_ms {
                validate_timeout(&format!("Plugin '{name}' timeout_ms"), timeout_ms)?;
            }
        }

        Ok(())
    }

    pub fn override_for(&self, plugin_name: &str) -> Option<&PluginOverride> {
        self.overrides.get(plugin_name)
    }

    /// Get the effective timeout for a plugin
    pub fn plugin_timeout(&self, plugin_name: &str) -> u64 {
        self.override_for(plugin_name)
            .and_then(|o| o.timeout_ms)
            .unwrap_or(self.default_timeout_ms)
    }
}

fn validate_timeout(what: &str, timeout_ms: u64) -> Result<(), String> {
    if timeout_ms < 100 {
        return Err(format!("{what} must be at least 100ms"));
    }

    if timeout_ms > 600_000 {
        return Err(format!("{what} cannot exceed 600000ms (10 minutes)"));
    }

    Ok(())
}
