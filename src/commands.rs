use crate::config::Config;
use crate::error::{ConfigError, GatewayError, Result};
use crate::gateway::Gateway;
use tracing::{error, info, warn};

/// Validate the configuration and deploy every script plugin without
/// serving. Fails when any plugin does not deploy.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");
    info!(
        listen = %config.listen_addr(),
        services = config.services.len(),
        proxies = config.proxies.len(),
        streams = config.change_streams.streams.len(),
        "Configured mounts"
    );

    let gateway = Gateway::builder(config).build()?;
    info!(
        interceptors = gateway.registry().interceptor_count(),
        services = gateway.registry().service_count(),
        "✓ Gateway assembled"
    );
    for stage in gateway.pipeline().stage_names() {
        info!("  stage: {stage}");
    }

    let Some(dir) = gateway.config().plugins.plugin_dir.clone() else {
        info!("No plugin directory configured, skipping script plugins");
        gateway.shutdown().await;
        return Ok(());
    };

    info!("Deploying script plugins from {}", dir.display());
    let report = match gateway.deploy_plugins().await {
        Ok(report) => report,
        Err(e) => {
            gateway.shutdown().await;
            return Err(e);
        }
    };

    for name in &report.deployed {
        info!("✓ {name}");
    }
    for (path, e) in &report.failed {
        error!("✗ {}: {}", path.display(), e);
    }
    gateway.shutdown().await;

    if report.is_clean() {
        info!("✓ All {} plugin(s) deployed", report.deployed.len());
        Ok(())
    } else {
        warn!("{} plugin(s) failed to deploy", report.failed.len());
        Err(GatewayError::Config(ConfigError::Validation(format!(
            "{} of {} plugin(s) failed to deploy",
            report.failed.len(),
            report.failed.len() + report.deployed.len()
        ))))
    }
}
