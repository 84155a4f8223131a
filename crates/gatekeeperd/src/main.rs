//! gatekeeperd: authenticating TCP relay daemon.
//!
//! Usage: `gatekeeperd [mappings-path]`
//!
//! The mapping file defaults to `[mappings] path` from the config file.

use std::path::PathBuf;

use anyhow::{Context, Result};

use gatekeeper_core::{GatekeeperConfig, MappingTable};
use gatekeeper_relay::Listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = GatekeeperConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = GatekeeperConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatekeeperConfig::default()
    });
    if let Some(path) = std::env::args_os().nth(1) {
        config.mappings.path = PathBuf::from(path);
    }

    let mappings = MappingTable::from_file(&config.mappings.path)
        .with_context(|| format!("failed to load mappings from {}", config.mappings.path.display()))?;
    if mappings.is_empty() {
        tracing::warn!("mapping table is empty; every handshake will be rejected");
    }
    tracing::info!(
        addr = %config.listen.addr,
        port = config.listen.port,
        mappings = mappings.len(),
        "gatekeeperd starting"
    );

    let listener = Listener::new(config, mappings);
    let handle = listener.handle();

    // Ctrl-C / SIGTERM → shutdown
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        handle.shutdown();
    });

    listener.run().await.context("listener failed")?;
    tracing::info!("gatekeeperd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
