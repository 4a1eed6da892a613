//! Home hub server
//!
//! Main entry point. Takes an optional path to the YAML configuration file
//! (default `hub.yaml`).

use anyhow::Result;
use hub_core::SystemClock;
use hub_server::{Hub, HubConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "hub.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    info!(path = %config_path, "Starting home hub");

    let config = HubConfig::load(&config_path)?;

    // Presence scanning needs a device integration; none ships with the core
    let hub = Hub::new(&config, Arc::new(SystemClock), None);
    hub.start()?;

    info!("Home hub is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    hub.stop().await;

    Ok(())
}
