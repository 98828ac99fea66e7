//! Plugin catalog and script plugin deployment
//!
//! - `record`: registry entries for interceptors and services
//! - `registry`: the concurrent catalog queried on every intercept point
//! - `config`: plugin directory, script host limits and operator overrides
//! - `deployer`: evaluates script files and registers what they declare
//! - `watcher`: redeploys scripts when the plugin directory changes

pub mod config;
pub mod deployer;
pub mod record;
pub mod registry;
pub mod watcher;

pub use config::{PluginConfig, PluginOverride};
pub use deployer::{DeployReport, PluginDeployer};
pub use record::{
    InterceptorDescriptor, InterceptorRecord, PluginOrigin, PluginRecord, ServiceDescriptor,
    ServiceRecord,
};
pub use registry::PluginRegistry;
pub use watcher::{spawn_hot_deploy, PluginEvent, PluginWatcher};
