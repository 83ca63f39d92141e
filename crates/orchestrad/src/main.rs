//! Orchestra kernel daemon
//!
//! Loads config, opens the kernel database and serves the HTTP API until
//! interrupted.

use anyhow::{Context, Result};
use orchestrad::{server, AppState, Kernel, KernelConfig};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = Instant::now();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("[BOOT] orchestrad v{} starting", env!("CARGO_PKG_VERSION"));

    let config = KernelConfig::load();
    info!("[BOOT] Environment: {}", config.environment);

    let kernel = Kernel::open(&config, started_at)
        .await
        .context("opening kernel")?;
    let services = kernel.db.count_services().await.context("reading registry")?;
    info!("[BOOT] Kernel ready with {} registered services", services);

    server::run(AppState::new(kernel), &config.server, shutdown_signal()).await?;

    info!("Shutting down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
