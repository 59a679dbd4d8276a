//! `GET /stream/{session_id}` — the Control Gateway's single streaming
//! route (`spec.md` §4.4). Authenticates, resolves the session via the
//! Registry, dials the owning host's Supervisor relay port, and splices
//! bytes both ways with no protocol awareness.
//!
//! The splice itself is the same `copy_bidirectional` idea used by the
//! Supervisor's own tunnel splice, adapted for one TCP-speaking side and
//! one WebSocket-speaking side: axum's `WebSocket` is message-framed, not
//! `AsyncRead`/`AsyncWrite`, so the two halves run as a pair of tasks
//! moving bytes rather than a single `copy_bidirectional` call.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use helix_dbus::types::LifecycleState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::GatewayConfig;
use crate::rate_limit::RateLimiter;
use crate::registry_client::RegistryClient;

#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<GatewayConfig>,
    pub registry: RegistryClient,
    pub limiter: RateLimiter,
}

/// `?codecs=<bitmask>&w=<int>&h=<int>&fps=<int>&touch=<0|1>` negotiation
/// query forwarded to the Edge Server as a one-time preamble (`spec.md`
/// §4.2 handshake inputs).
#[derive(Debug, serde::Deserialize)]
pub struct StreamQuery {
    pub codecs: Option<String>,
    pub w: Option<u16>,
    pub h: Option<u16>,
    pub fps: Option<u8>,
    pub touch: Option<u8>,
}

pub async fn stream_upgrade(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(principal) = crate::auth::authenticate(&state.cfg, authorization) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if !state.limiter.check(&principal) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let Some(record) = wait_for_ready(&state, &session_id).await else {
        let Some(last) = state.registry.lookup(&session_id).await else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if last.lifecycle_state.is_terminal() {
            return StatusCode::NOT_FOUND.into_response();
        }
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Retry-After", "5")],
        )
            .into_response();
    };

    let Some(&relay_addr) = state.cfg.host_relay_addrs.get(&record.host_id) else {
        tracing::error!(host_id = %record.host_id, "no relay address configured for host");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let negotiation = encode_query(&query);
    let tunnel_id = record.container_id.clone();
    let registry = state.registry.clone();
    let session_id_for_close = session_id.clone();

    ws.on_upgrade(move |socket| async move {
        registry.set_viewer_count(&session_id_for_close, 1).await;
        if let Err(e) = splice(socket, relay_addr, &tunnel_id, &negotiation, state.cfg.relay_connect_timeout_secs).await
        {
            tracing::warn!(session_id = %session_id_for_close, error = %e, "tunnel splice ended");
        }
        registry.set_viewer_count(&session_id_for_close, 0).await;
    })
}

/// Close code `1011` ("internal error") per `spec.md` §4.4: sent to the
/// viewer whenever the Supervisor relay connection fails after upgrade, so
/// the browser distinguishes a server-side fault from a clean shutdown and
/// reconnects rather than giving up.
async fn close_with_internal_error(ws_tx: &tokio::sync::Mutex<futures_util::stream::SplitSink<WebSocket, Message>>) {
    let mut tx = ws_tx.lock().await;
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: 1011,
            reason: "tunnel relay error".into(),
        })))
        .await;
}

async fn wait_for_ready(state: &GatewayState, session_id: &str) -> Option<helix_dbus::types::SessionRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(state.cfg.wait_timeout_secs);
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        if let Some(record) = state.registry.lookup(session_id).await {
            if record.lifecycle_state == LifecycleState::Ready {
                return Some(record);
            }
            if record.lifecycle_state.is_terminal() {
                return None;
            }
        } else {
            return None;
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        poll.tick().await;
    }
}

fn encode_query(query: &StreamQuery) -> Vec<u8> {
    let mut parts = Vec::new();
    if let Some(codecs) = &query.codecs {
        parts.push(format!("codecs={codecs}"));
    }
    if let Some(w) = query.w {
        parts.push(format!("w={w}"));
    }
    if let Some(h) = query.h {
        parts.push(format!("h={h}"));
    }
    if let Some(fps) = query.fps {
        parts.push(format!("fps={fps}"));
    }
    if let Some(touch) = query.touch {
        parts.push(format!("touch={touch}"));
    }
    parts.join("&").into_bytes()
}

/// Handshake with the Supervisor's relay port, write the negotiation
/// preamble, then move bytes in both directions until either side closes.
async fn splice(
    socket: WebSocket,
    relay_addr: std::net::SocketAddr,
    tunnel_id: &str,
    negotiation: &[u8],
    connect_timeout_secs: u64,
) -> anyhow::Result<()> {
    let mut tcp = tokio::time::timeout(
        Duration::from_secs(connect_timeout_secs),
        TcpStream::connect(relay_addr),
    )
    .await??;

    const RELAY_KIND_VIEWER: u8 = 0;
    tcp.write_all(&[RELAY_KIND_VIEWER]).await?;

    let id_bytes = tunnel_id.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    tcp.write_all(&(id_bytes.len() as u16).to_be_bytes()).await?;
    tcp.write_all(id_bytes).await?;

    #[allow(clippy::cast_possible_truncation)]
    tcp.write_all(&(negotiation.len() as u16).to_be_bytes()).await?;
    tcp.write_all(negotiation).await?;

    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));

    // Each WebSocket message is relayed as one `[len: u32 BE][payload]` unit
    // rather than a raw byte copy, so a single video/audio frame can't be
    // split (or an adjacent one coalesced) by the relay TCP connection's read
    // buffering — see the matching framing on the Supervisor's relay side.
    let upstream = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Binary(data) => {
                    #[allow(clippy::cast_possible_truncation)]
                    tcp_write.write_all(&(data.len() as u32).to_be_bytes()).await?;
                    tcp_write.write_all(&data).await?;
                }
                Message::Close(_) => break,
                Message::Text(_) | Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let downstream_tx = Arc::clone(&ws_tx);
    let downstream = async move {
        loop {
            let mut len_buf = [0u8; 4];
            match tcp_read.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            tcp_read.read_exact(&mut payload).await?;
            if downstream_tx.lock().await.send(Message::Binary(payload.into())).await.is_err() {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let result = tokio::select! {
        result = upstream => result,
        result = downstream => result,
    };
    if result.is_err() {
        close_with_internal_error(&ws_tx).await;
    }
    result?;
    Ok(())
}
