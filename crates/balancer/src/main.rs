//! ProxLB - load balancing daemon for Proxmox VE clusters
//!
//! Periodically snapshots node and workload utilization, plans live
//! migrations that even out the load, and executes them.

use anyhow::Result;
use balancer_lib::{
    control::ControlLoopBuilder,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    platform::{PlatformClient, ProxmoxClient},
    StatusHandle,
};
use clap::Parser;
use proxlb::{api, config::DaemonConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "proxlb", version, about = "Rebalance running workloads across Proxmox VE nodes")]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "PROXLB_CONFIG")]
    config: Option<PathBuf>,

    /// Plan and log migrations without executing them
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle, print its report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Invalid configuration is fatal before anything starts
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if cli.dry_run {
        config.balancer.dry_run = true;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(fmt::layer().json())
        .init();

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(VERSION, config.balancer.dry_run, config.balancer.interval());

    let client: Arc<dyn PlatformClient> = Arc::new(ProxmoxClient::new(config.proxmox.clone())?);
    let status = StatusHandle::new();

    let mut control = ControlLoopBuilder::new()
        .client(client)
        .config(config.balancer.clone())
        .health(health_registry.clone())
        .status(status.clone())
        .logger(logger.clone())
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if cli.once {
        let report = control.run_cycle(&shutdown_rx).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        logger.log_shutdown("single cycle completed");
        if let Some(failure) = report.failure {
            anyhow::bail!("cycle aborted while {}: {}", failure.stage, failure.message);
        }
        return Ok(());
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), status));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));
    let mut loop_handle = tokio::spawn(control.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
        // The loop only returns on shutdown, so getting here means its task died
        joined = &mut loop_handle => {
            let reason = match joined {
                Ok(()) => "control loop returned without shutdown".to_string(),
                Err(e) => format!("control loop task failed: {e}"),
            };
            health_registry
                .set_unhealthy(components::PLANNER, reason.clone())
                .await;
            health_registry.set_ready(false).await;
            logger.log_shutdown(&reason);
            api_handle.abort();
            anyhow::bail!(reason);
        }
    }

    // In-flight migrations finish before the loop returns
    if shutdown_tx.send(true).is_err() {
        warn!("Control loop already stopped");
    }
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Control loop task failed");
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
