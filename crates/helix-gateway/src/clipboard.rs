//! `GET`/`POST /sessions/{id}/clipboard`, `GET /sessions/{id}/screenshot`,
//! `GET /sessions/{id}/health` — the Gateway's one-shot exchanges over the
//! tunnel's control substream (`spec.md` §4.4, §6.3). Each call
//! dials the Supervisor's relay port, requests the control substream, writes
//! one length-prefixed request and reads back one length-prefixed response —
//! no persistent connection, no HTTP framing on the wire between Gateway and
//! Supervisor, since the control substream only ever carries one exchange
//! per clipboard call (`spec.md` §4.3 "one control channel used for health
//! and clipboard HTTP").

use std::time::Duration;

use axum::body::Bytes as AxumBytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::relay::GatewayState;

const RELAY_KIND_CONTROL: u8 = 1;
const METHOD_GET: u8 = 0;
const METHOD_POST: u8 = 1;
const METHOD_SCREENSHOT: u8 = 2;

pub async fn get_clipboard(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if crate::auth::authenticate(&state.cfg, authorization).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    forward(&state, &session_id, METHOD_GET, b"").await
}

pub async fn post_clipboard(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: AxumBytes,
) -> Response {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if crate::auth::authenticate(&state.cfg, authorization).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    forward(&state, &session_id, METHOD_POST, &body).await
}

pub async fn get_screenshot(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if crate::auth::authenticate(&state.cfg, authorization).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    forward_with_content_type(&state, &session_id, METHOD_SCREENSHOT, b"", "image/png").await
}

/// Unlike clipboard/screenshot, `lifecycle_state` is owned by the Registry,
/// not the container's Edge Server, so this answers straight from the
/// already-fetched session record instead of crossing the tunnel.
pub async fn get_health(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if crate::auth::authenticate(&state.cfg, authorization).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(record) = state.registry.lookup(&session_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = serde_json::json!({
        "lifecycle_state": record.lifecycle_state.to_string(),
        "ready_at": record.created_at,
        "viewer_count": record.viewer_count,
    });
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn forward(state: &GatewayState, session_id: &str, method: u8, body: &[u8]) -> Response {
    forward_with_content_type(state, session_id, method, body, "application/json").await
}

async fn forward_with_content_type(
    state: &GatewayState,
    session_id: &str,
    method: u8,
    body: &[u8],
    content_type: &'static str,
) -> Response {
    let Some(record) = state.registry.lookup(session_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(&relay_addr) = state.cfg.host_relay_addrs.get(&record.host_id) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    match exchange(relay_addr, &record.container_id, method, body, state.cfg.relay_connect_timeout_secs).await {
        Ok(response_bytes) => {
            ([(axum::http::header::CONTENT_TYPE, content_type)], response_bytes).into_response()
        }
        Err(e) => {
            tracing::warn!(session_id, error = %e, "control-channel exchange failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Dial the relay port, send one length-prefixed request over the control
/// substream as `[method(1) | body_len(4 BE) | body]`, and read back one
/// length-prefixed response (`helix-supervisor`'s `handle_relay_control`).
async fn exchange(
    relay_addr: std::net::SocketAddr,
    tunnel_id: &str,
    method: u8,
    body: &[u8],
    connect_timeout_secs: u64,
) -> anyhow::Result<Vec<u8>> {
    let mut tcp = tokio::time::timeout(
        Duration::from_secs(connect_timeout_secs),
        TcpStream::connect(relay_addr),
    )
    .await??;

    tcp.write_all(&[RELAY_KIND_CONTROL]).await?;
    let id_bytes = tunnel_id.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    tcp.write_all(&(id_bytes.len() as u16).to_be_bytes()).await?;
    tcp.write_all(id_bytes).await?;

    let mut request = Vec::with_capacity(5 + body.len());
    request.push(method);
    #[allow(clippy::cast_possible_truncation)]
    request.extend_from_slice(&(body.len() as u32).to_be_bytes());
    request.extend_from_slice(body);

    #[allow(clippy::cast_possible_truncation)]
    tcp.write_all(&(request.len() as u32).to_be_bytes()).await?;
    tcp.write_all(&request).await?;

    let mut resp_len_buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), tcp.read_exact(&mut resp_len_buf)).await??;
    let resp_len = u32::from_be_bytes(resp_len_buf) as usize;
    let mut response = vec![0u8; resp_len];
    tokio::time::timeout(Duration::from_secs(5), tcp.read_exact(&mut response)).await??;
    Ok(response)
}
