//! Kiln machine agent
//!
//! Runs on a host and keeps its microVMs converged on their desired state.
//!
//! ## Architecture
//!
//! - **Machine Service**: restores persisted machines and owns their controllers
//! - **Machine Controller**: per-machine event loop, reconciliation and monitoring
//! - **Providers**: network (mock or TAP), volumes, images, runtime, persistence (SQLite)

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_agent::config::{Config, NetworkMode};
use kiln_agent::network::TapNetworkProvider;
use kiln_agent::providers::mock::MockProviders;
use kiln_agent::providers::NetworkProvider;
use kiln_agent::service::MachineService;
use kiln_agent::state::SqliteStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln machine agent");
    info!(
        data_dir = %config.data_dir.display(),
        monitor = ?config.monitor,
        network = ?config.network,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let store = SqliteStore::open(config.database_path()).context("failed to open state store")?;

    // Hypervisor, image and volume backends are mocked in this build.
    let mocks = MockProviders::new();
    let mut providers = mocks.providers();
    providers.persistence = Arc::new(store.clone());

    if config.network == NetworkMode::Tap {
        let tap = TapNetworkProvider::new(&config.tap_subnet, config.tap_mtu)?;
        let machines = store.list_machines()?;
        tap.restore(machines.iter().filter_map(|m| m.network_interface.as_ref()));
        providers.network = Arc::new(tap) as Arc<dyn NetworkProvider>;
    }

    let service = MachineService::new(providers, config.controller());
    let restored = service.load().await?;
    info!(machines = restored, "Machine agent ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    service.shutdown().await;

    info!("Machine agent shutdown complete");
    Ok(())
}
