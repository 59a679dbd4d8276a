use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;

mod auth;
mod clipboard;
mod config;
mod rate_limit;
mod registry_client;
mod relay;
mod tls;

use rate_limit::RateLimiter;
use registry_client::RegistryClient;
use relay::GatewayState;

/// Control Gateway: the single public HTTPS-reachable surface for viewers
/// of Helix RDSC sessions.
#[derive(Parser, Debug)]
#[command(name = "helix-gatewayd", version, about)]
struct Cli {
    /// Path to the gateway configuration file (TOML).
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

    tracing::info!(bind = %cfg.bind, "starting helix-gatewayd");

    let tls_context = match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert), Some(key)) => tls::load_from_files(cert, key)?,
        (None, None) => tls::generate_self_signed(cfg.bind.ip())?,
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("tls_cert and tls_key must both be set or both be omitted")
        }
    };

    let registry = RegistryClient::connect()
        .await
        .context("failed to connect to the Session Registry over D-Bus")?;
    let limiter = RateLimiter::new(cfg.rate_limit_per_sec);

    let state = GatewayState { cfg: Arc::new(cfg), registry, limiter };

    let app = Router::new()
        .route("/stream/:session_id", get(relay::stream_upgrade))
        .route(
            "/sessions/:session_id/clipboard",
            get(clipboard::get_clipboard).post(clipboard::post_clipboard),
        )
        .route("/sessions/:session_id/screenshot", get(clipboard::get_screenshot))
        .route("/sessions/:session_id/health", get(clipboard::get_health))
        .with_state(state.clone());

    let bind: IpAddr = state.cfg.bind.ip();
    tracing::info!(%bind, port = state.cfg.bind.port(), "Control Gateway listening");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(state.cfg.bind, tls_context.config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("gateway server error")?;

    Ok(())
}
