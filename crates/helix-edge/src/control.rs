//! Dispatch for the tunnel's control substream and the equivalent local
//! HTTP routes (`spec.md` §4.2 item 5, §4.3 "one control channel used for
//! health and clipboard HTTP"). Both surfaces answer the same underlying
//! clipboard/screenshot state; the tunnel path exists for the Control
//! Gateway, the HTTP path exists for "agents that don't open a WebSocket"
//! (`spec.md` §4.2).

use std::sync::Arc;

use axum::body::Bytes as AxumBytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::clipboard::ClipboardSlot;
use crate::screenshot::ScreenshotCache;

const METHOD_GET: u8 = 0;
const METHOD_POST: u8 = 1;
const METHOD_SCREENSHOT: u8 = 2;

#[derive(Clone)]
pub struct EdgeHttpState {
    pub clipboard: Arc<ClipboardSlot>,
    pub screenshot: Arc<ScreenshotCache>,
}

#[derive(Deserialize)]
struct ClipboardWriteRequest {
    data: String,
    #[serde(rename = "type", default = "default_mime_type")]
    mime_type: String,
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

/// Handles one `[method(1) body_len(4 BE) body]` request arriving over the
/// tunnel's control substream and returns the raw response bytes — the
/// `MuxFrame`/relay framing around this exchange already delimits the
/// message, so the response carries no additional length prefix of its own.
pub async fn dispatch(payload: Bytes, clipboard: &ClipboardSlot, screenshot: &ScreenshotCache) -> Bytes {
    if payload.is_empty() {
        return clipboard_json(clipboard);
    }
    let mut cursor = payload;
    let method = cursor.get_u8();
    if cursor.remaining() < 4 {
        return Bytes::new();
    }
    let body_len = cursor.get_u32() as usize;
    let body = if cursor.remaining() >= body_len { cursor.split_to(body_len) } else { Bytes::new() };

    match method {
        METHOD_GET => clipboard_json(clipboard),
        METHOD_POST => {
            if let Ok(req) = serde_json::from_slice::<ClipboardWriteRequest>(&body) {
                clipboard.write(req.data, req.mime_type);
            }
            clipboard_json(clipboard)
        }
        METHOD_SCREENSHOT => screenshot.latest().map_or_else(Bytes::new, Bytes::from),
        _ => Bytes::new(),
    }
}

fn clipboard_json(clipboard: &ClipboardSlot) -> Bytes {
    Bytes::from(serde_json::to_vec(&clipboard.read()).unwrap_or_default())
}

pub async fn http_get_clipboard(State(state): State<EdgeHttpState>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&state.clipboard.read()).unwrap_or_default(),
    )
        .into_response()
}

pub async fn http_post_clipboard(State(state): State<EdgeHttpState>, body: AxumBytes) -> Response {
    match serde_json::from_slice::<ClipboardWriteRequest>(&body) {
        Ok(req) => {
            state.clipboard.write(req.data, req.mime_type);
            (
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                serde_json::to_string(&state.clipboard.read()).unwrap_or_default(),
            )
                .into_response()
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

pub async fn http_get_screenshot(State(state): State<EdgeHttpState>) -> Response {
    match state.screenshot.latest() {
        Some(png) => ([(axum::http::header::CONTENT_TYPE, "image/png")], png).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

pub async fn http_get_health() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&HealthBody { status: "ok" }).unwrap_or_default(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_method_returns_current_clipboard() {
        let clipboard = ClipboardSlot::default();
        clipboard.write("hello".into(), "text/plain".into());
        let screenshot = ScreenshotCache::default();

        let mut req = vec![METHOD_GET];
        req.extend_from_slice(&0u32.to_be_bytes());
        let resp = dispatch(Bytes::from(req), &clipboard, &screenshot).await;
        let parsed: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(parsed["data"], "hello");
    }

    #[tokio::test]
    async fn post_method_writes_and_echoes_clipboard() {
        let clipboard = ClipboardSlot::default();
        let screenshot = ScreenshotCache::default();

        let body = serde_json::to_vec(&serde_json::json!({"data": "new text", "type": "text/plain"})).unwrap();
        let mut req = vec![METHOD_POST];
        #[allow(clippy::cast_possible_truncation)]
        req.extend_from_slice(&(body.len() as u32).to_be_bytes());
        req.extend_from_slice(&body);

        let resp = dispatch(Bytes::from(req), &clipboard, &screenshot).await;
        let parsed: serde_json::Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(parsed["data"], "new text");
        assert_eq!(clipboard.read().data, "new text");
    }

    #[tokio::test]
    async fn screenshot_method_returns_empty_when_uncached() {
        let clipboard = ClipboardSlot::default();
        let screenshot = ScreenshotCache::default();
        let mut req = vec![METHOD_SCREENSHOT];
        req.extend_from_slice(&0u32.to_be_bytes());
        let resp = dispatch(Bytes::from(req), &clipboard, &screenshot).await;
        assert!(resp.is_empty());
    }
}
