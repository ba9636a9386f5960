//! Fabric Reconciler - Main Entry Point

use fabric_reconciler::{FabricController, ReconcilerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fabric Reconciler v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/fabric/reconciler.json".into());

    let config = ReconcilerConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
        ReconcilerConfig::default()
    });

    let controller = Arc::new(FabricController::from_config(config)?);
    controller.run().await?;

    Ok(())
}
