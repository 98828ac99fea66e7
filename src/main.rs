use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use restpipe::commands;
use restpipe::config::{self, Config};
use restpipe::gateway::Gateway;
use restpipe::web;

#[derive(Parser, Debug)]
#[command(name = "restpipe")]
#[command(about = "A pluggable HTTP request pipeline with interceptors and change streams", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the gateway (default)
    Run,
    /// Validate configuration and deploy script plugins without serving
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration")?,
    };

    init_tracing(&config, args.debug)?;
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check => Ok(commands::run_config_check(config).await?),
        Command::Run => run(config).await,
    }
}

fn init_tracing(config: &Config, debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env().add_directive(
        format!("restpipe={level}")
            .parse()
            .context("Invalid log directive")?,
    );

    if config.tracing.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting restpipe on {}", config.listen_addr());

    let gateway = Arc::new(Gateway::builder(config).build()?);

    let report = gateway.deploy_plugins().await?;
    if !report.deployed.is_empty() {
        info!("Deployed {} script plugin(s)", report.deployed.len());
    }
    for (path, e) in &report.failed {
        error!(path = %path.display(), error = %e, "Script plugin not deployed");
    }

    // Keep the watcher alive for the lifetime of the server
    let hot_deploy = gateway.start_hot_deploy()?;
    if hot_deploy.is_some() {
        info!("Watching the plugin directory for changes");
    }

    let server = tokio::spawn(web::serve(gateway.clone(), shutdown_signal()));
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("Shutting down restpipe");
    if let Some(hot_deploy) = hot_deploy {
        hot_deploy.task.abort();
        drop(hot_deploy.watcher);
    }

    let shutdown = tokio::time::timeout(tokio::time::Duration::from_secs(30), gateway.shutdown());
    if shutdown.await.is_err() {
        warn!("Shutdown timeout exceeded");
    } else {
        info!("Graceful shutdown completed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
