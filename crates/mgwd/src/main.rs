//! mgwd - Module Gateway Daemon
//!
//! Connects the device modules of a vehicle to one or more fleet servers.
//!
//! # Usage
//!
//! ```bash
//! mgwd /etc/mgw/mgwd.toml
//! mgwd --check /etc/mgw/mgwd.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mgw_core::CommandQueue;
use mgw_external::ExternalClient;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod modules;

use config::{GatewayConfig, LogConfig};

/// Read granularity of the command consumer
const COMMAND_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "mgwd")]
#[command(about = "Module gateway daemon", version)]
struct Args {
    /// Configuration file path (TOML format)
    config: PathBuf,

    /// Enable debug output of the gateway crates
    #[arg(short, long)]
    verbose: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

fn init_logging(log: &LogConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = if verbose {
            format!("{},mgwd=debug,mgw_external=debug,mgw_core=debug", log.filter)
        } else {
            log.filter.clone()
        };
        EnvFilter::new(directives)
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Stand-in for the local device server: log commands until shutdown
async fn consume_commands(commands: Arc<CommandQueue>, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => {}
            command = commands.pop(COMMAND_POLL) => {
                if let Some(command) = command {
                    info!(
                        device = %command.device,
                        bytes = command.command.len(),
                        "Command for local device"
                    );
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Invalid configuration {}", args.config.display()))?;
    let library = modules::build_library(&config.modules);

    if args.check {
        ExternalClient::new(config.external, library)
            .context("Failed to create external client")?;
        println!("{}: OK", args.config.display());
        return Ok(());
    }

    init_logging(&config.log, args.verbose);
    info!(
        company = %config.external.company,
        vehicle = %config.external.vehicle_name,
        endpoints = config.external.endpoints.len(),
        modules = config.modules.len(),
        "Starting mgwd"
    );

    let client = ExternalClient::new(config.external, library)
        .context("Failed to create external client")?;
    if client.connections().is_empty() {
        warn!("No fleet-server endpoint configured, statuses will be dropped");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(consume_commands(client.commands(), shutdown_rx.clone()));

    let engine = tokio::spawn(client.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    engine.await.context("External client task failed")?;
    consumer.await.context("Command consumer task failed")?;

    info!("mgwd stopped");
    Ok(())
}
