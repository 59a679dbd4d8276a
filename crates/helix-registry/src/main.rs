use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

mod catalog;
mod config;
mod dbus;
mod lease;

use catalog::Catalog;

/// Session Registry: the process-wide in-memory catalog mapping
/// `session_id` to its host, container, tunnel, and lifecycle state.
#[derive(Parser, Debug)]
#[command(name = "helix-registryd", version, about)]
struct Cli {
    /// Path to the registry configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    tracing::info!(
        lease_expire_secs = cfg.lease_expire_secs,
        sweep_interval_secs = cfg.sweep_interval_secs,
        "starting helix-registryd"
    );

    let catalog = Catalog::new();

    tokio::spawn(lease::sweep_loop(cfg.clone(), catalog.clone()));

    let _dbus_conn = dbus::start(catalog.clone())
        .await
        .context("failed to start Registry1 D-Bus interface")?;

    let shutdown = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    };

    shutdown.await;
    tracing::info!("registry stopped");
    Ok(())
}
