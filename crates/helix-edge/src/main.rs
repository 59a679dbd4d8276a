use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use helix_edge::clipboard::{self, ClipboardSlot};
use helix_edge::control::{self, EdgeHttpState};
use helix_edge::screenshot::ScreenshotCache;
use helix_edge::{config, container_id, tunnel, viewer};
use helix_input::libei::EiInput;
use tokio::sync::Mutex;

/// In-container Edge Server: terminates viewer WebSocket sessions relayed
/// through the Sandbox Supervisor's tunnel.
#[derive(Parser, Debug)]
#[command(name = "helix-edged", version, about)]
struct Cli {
    /// Path to the Edge Server configuration file (TOML).
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
    let mut cfg = config::load(cli.config.as_deref())?;

    // The Supervisor sets `HELIX_TUNNEL_ADDR` on every container it spawns
    // (`helix-supervisor`'s `spawner.rs`); that always wins over the config
    // file or the `HELIX__TUNNEL_ADDR` environment form, since it reflects
    // the actual host this container landed on.
    if let Ok(addr) = std::env::var("HELIX_TUNNEL_ADDR") {
        cfg.tunnel_addr = addr;
    }
    let cfg = Arc::new(cfg);

    let container_id = container_id::derive().context("failed to derive container id")?;

    tracing::info!(
        container_id,
        tunnel_addr = %cfg.tunnel_addr,
        local_http_bind = %cfg.local_http_bind,
        "starting helix-edged"
    );

    let ei_input = Arc::new(Mutex::new(
        EiInput::new().await.context("failed to initialize input injector")?,
    ));

    let clipboard = Arc::new(ClipboardSlot::default());
    let screenshot_cache = Arc::new(ScreenshotCache::default());

    tokio::spawn(clipboard::poll_native_clipboard(Arc::clone(&clipboard), cfg.clipboard_poll_hz));

    let viewer_spawner: tunnel::ViewerSpawnerHandle = {
        let ei_input = Arc::clone(&ei_input);
        let cfg = Arc::clone(&cfg);
        let screenshot_cache = Arc::clone(&screenshot_cache);
        Arc::new(move |_stream_id, inbox, outbound| {
            let ei_input = Arc::clone(&ei_input);
            let cfg = Arc::clone(&cfg);
            let screenshot_cache = Arc::clone(&screenshot_cache);
            tokio::spawn(viewer::run(inbox, outbound, ei_input, cfg, screenshot_cache));
        })
    };

    let control_handler: tunnel::ControlHandlerHandle = {
        let clipboard = Arc::clone(&clipboard);
        let screenshot_cache = Arc::clone(&screenshot_cache);
        Arc::new(move |payload| {
            let clipboard = Arc::clone(&clipboard);
            let screenshot_cache = Arc::clone(&screenshot_cache);
            Box::pin(async move { control::dispatch(payload, &clipboard, &screenshot_cache).await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = bytes::Bytes> + Send>>
        })
    };

    let redial_backoff = Duration::from_secs(cfg.tunnel_redial_backoff_secs);
    let tunnel_addr = cfg.tunnel_addr.clone();
    let tunnel_container_id = container_id.clone();
    tokio::spawn(async move {
        tunnel::run(&tunnel_addr, &tunnel_container_id, redial_backoff, viewer_spawner, control_handler).await
    });

    let http_state = EdgeHttpState { clipboard, screenshot: screenshot_cache };
    let app = Router::new()
        .route("/clipboard", get(control::http_get_clipboard).post(control::http_post_clipboard))
        .route("/screenshot", get(control::http_get_screenshot))
        .route("/health", get(control::http_get_health))
        .with_state(http_state);

    let listener = tokio::net::TcpListener::bind(&cfg.local_http_bind)
        .await
        .with_context(|| format!("failed to bind local HTTP surface {}", cfg.local_http_bind))?;

    let shutdown = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("local HTTP server error")?;

    Ok(())
}
