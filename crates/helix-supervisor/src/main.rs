use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod config;
mod dbus;
mod lifecycle;
mod session;
mod spawner;
mod tunnel;

use session::SessionTable;
use tunnel::TunnelRegistry;

/// Sandbox Supervisor: owns container lifecycle, health checks, and the
/// reverse-dialed tunnel from each container's Edge Server back to this
/// host, on behalf of the Control Gateway.
#[derive(Parser, Debug)]
#[command(name = "helix-supervisord", version, about)]
struct Cli {
    /// Path to the supervisor configuration file (TOML).
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
        host_id = %cfg.host_id,
        tunnel_bind = %cfg.tunnel_bind,
        relay_bind = %cfg.relay_bind,
        "starting helix-supervisord"
    );

    let table = SessionTable::new(cfg.host_id.clone(), cfg.capacity.clone(), cfg.state_file.clone());
    if let Err(e) = table.load_state().await {
        tracing::warn!(error = %e, "failed to load session state");
    }

    let tunnels = TunnelRegistry::new();

    let tunnel_accept = {
        let bind = cfg.tunnel_bind.clone();
        let tunnels = tunnels.clone();
        tokio::spawn(async move { tunnel::accept_tunnels(&bind, tunnels).await })
    };
    let relay_accept = {
        let bind = cfg.relay_bind.clone();
        let tunnels = tunnels.clone();
        tokio::spawn(async move { tunnel::accept_relays(&bind, tunnels).await })
    };

    tokio::spawn(lifecycle::health_loop(cfg.clone(), table.clone(), tunnels.clone()));

    let reap_cfg = cfg.clone();
    let reap_table = table.clone();
    let reap_tunnels = tunnels.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reap_cfg.reap_exited_secs));
        loop {
            interval.tick().await;
            lifecycle::reap(&reap_cfg, &reap_table, &reap_tunnels).await;
        }
    });

    let _dbus_conn = match dbus::start(cfg.clone(), table.clone(), tunnels.clone()).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(error = %e, "failed to start D-Bus interface, continuing without it");
            None
        }
    };

    let shutdown_table = table.clone();
    let shutdown = async move {
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

        if let Err(e) = shutdown_table.save_state().await {
            tracing::warn!(error = %e, "failed to save state on shutdown");
        }
    };

    tokio::select! {
        result = tunnel_accept => {
            result.context("tunnel accept task panicked")?.context("tunnel accept loop error")?;
        }
        result = relay_accept => {
            result.context("relay accept task panicked")?.context("relay accept loop error")?;
        }
        () = shutdown => {
            tracing::info!("supervisor stopped");
        }
    }

    Ok(())
}
