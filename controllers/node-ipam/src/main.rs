//! Node IPAM Controller
//!
//! Assigns Pod CIDRs to Kubernetes nodes from `ClusterCIDR` pools.
//!
//! Each `ClusterCIDR` declares an IPv4 and/or IPv6 block, the size of the
//! range every node gets from it, and a node selector. A new node receives
//! one range per family from the best matching pool; a deleted node gives
//! its ranges back. Pools are kept alive by a finalizer until no node uses
//! them anymore.

mod backoff;
mod candidate;
mod client;
mod config;
mod controller;
mod error;
mod metrics;
mod reconciler;
mod registry;
mod selector;
mod server;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Node IPAM Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Node workers: {}", config.node_workers);
    info!("  ClusterCIDR workers: {}", config.pool_workers);
    info!("  Max retries: {}", config.max_retries);
    info!("  Health probe address: {}", config.health_probe_addr);
    info!("  Retry backoff: {:?} up to {:?}", config.backoff_base, config.backoff_max);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal");
        signal.cancel();
    });

    // Initialize and run controller
    let controller = Controller::new(config, shutdown).await?;
    controller.run().await?;

    info!("Node IPAM Controller stopped");
    Ok(())
}
