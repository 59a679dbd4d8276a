//! Edge-side half of the reverse-dialed tunnel (`spec.md` §4.3 "Tunnel
//! protocol"). The container always dials out to the Sandbox Supervisor —
//! never the reverse — so this is a connect-and-retry client mirroring the
//! Supervisor's accept loop in `helix-supervisor`'s `tunnel.rs`, built on the
//! same `MuxFrame` framing (duplicated in `mux.rs`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::mux::{MuxFrame, KIND_CONTROL, KIND_VIEWER_CLOSE, KIND_VIEWER_DATA, KIND_VIEWER_OPEN};

/// A viewer task's handle back onto the shared tunnel's single TCP
/// connection. Cloned per viewer; every viewer multiplexes writes through
/// the same outbound channel and writer task.
#[derive(Clone)]
pub struct ViewerOutbound {
    stream_id: u32,
    outbound: mpsc::Sender<MuxFrame>,
}

/// Result of a non-blocking send attempt, used by `helix-edge`'s per-viewer
/// backpressure gate (`spec.md` §5) to observe queue depth without stalling
/// the capture-sample loop on a slow viewer.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendOutcome {
    Sent,
    Full,
    Closed,
}

impl ViewerOutbound {
    #[cfg(test)]
    pub(crate) fn new_for_test(stream_id: u32, outbound: mpsc::Sender<MuxFrame>) -> Self {
        Self { stream_id, outbound }
    }

    pub async fn send(&self, payload: Bytes) -> bool {
        self.outbound
            .send(MuxFrame { kind: KIND_VIEWER_DATA, stream_id: self.stream_id, payload })
            .await
            .is_ok()
    }

    /// Non-blocking counterpart of [`Self::send`] — lets the caller track
    /// its own queue depth and react to sustained fullness instead of
    /// blocking the whole viewer task on a slow tunnel writer.
    pub fn try_send(&self, payload: Bytes) -> TrySendOutcome {
        match self.outbound.try_send(MuxFrame { kind: KIND_VIEWER_DATA, stream_id: self.stream_id, payload }) {
            Ok(()) => TrySendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => TrySendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => TrySendOutcome::Closed,
        }
    }

    /// Tells the Supervisor this viewer substream is done; it tears down its
    /// side of the relay splice in response (mirrors the Supervisor sending
    /// the matching frame when the Gateway's relay connection closes first).
    pub async fn close(&self) {
        let _ = self
            .outbound
            .send(MuxFrame { kind: KIND_VIEWER_CLOSE, stream_id: self.stream_id, payload: Bytes::new() })
            .await;
    }
}

pub type ControlHandlerHandle = Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Bytes> + Send>> + Send + Sync>;
pub type ViewerSpawnerHandle = Arc<dyn Fn(u32, mpsc::Receiver<Bytes>, ViewerOutbound) + Send + Sync>;

/// Dial the Supervisor's tunnel-accept port, send the `container_id`
/// handshake, then run the read/write loop until the connection drops,
/// retrying with a fixed backoff forever — there is no terminal failure
/// mode for the Edge Server's tunnel client short of process exit.
pub async fn run(
    tunnel_addr: &str,
    container_id: &str,
    redial_backoff: Duration,
    on_viewer_open: ViewerSpawnerHandle,
    on_control_request: ControlHandlerHandle,
) -> ! {
    loop {
        match dial_once(tunnel_addr, container_id, &on_viewer_open, &on_control_request).await {
            Ok(()) => tracing::info!("tunnel connection closed, redialing"),
            Err(e) => tracing::warn!(error = %e, "tunnel dial failed, redialing"),
        }
        tokio::time::sleep(redial_backoff).await;
    }
}

async fn dial_once(
    tunnel_addr: &str,
    container_id: &str,
    on_viewer_open: &ViewerSpawnerHandle,
    on_control_request: &ControlHandlerHandle,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(tunnel_addr).await?;
    tracing::info!(tunnel_addr, container_id, "tunnel connected");
    let (mut read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MuxFrame>(256);

    MuxFrame { kind: KIND_CONTROL, stream_id: 0, payload: Bytes::copy_from_slice(container_id.as_bytes()) }
        .write_to(&mut write_half)
        .await?;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if frame.write_to(&mut write_half).await.is_err() {
                break;
            }
        }
    });

    let viewer_inboxes: Arc<DashMap<u32, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());

    let result = loop {
        match MuxFrame::read_from(&mut read_half).await {
            Ok(Some(frame)) => match frame.kind {
                KIND_VIEWER_OPEN => {
                    let (inbox_tx, inbox_rx) = mpsc::channel(64);
                    viewer_inboxes.insert(frame.stream_id, inbox_tx);
                    let outbound = ViewerOutbound { stream_id: frame.stream_id, outbound: outbound_tx.clone() };
                    (on_viewer_open)(frame.stream_id, inbox_rx, outbound);
                }
                KIND_VIEWER_DATA => {
                    if let Some(inbox) = viewer_inboxes.get(&frame.stream_id) {
                        if inbox.send(frame.payload).await.is_err() {
                            viewer_inboxes.remove(&frame.stream_id);
                        }
                    }
                }
                KIND_VIEWER_CLOSE => {
                    viewer_inboxes.remove(&frame.stream_id);
                }
                KIND_CONTROL => {
                    let outbound_tx = outbound_tx.clone();
                    let on_control_request = Arc::clone(on_control_request);
                    tokio::spawn(async move {
                        let response = (on_control_request)(frame.payload).await;
                        let _ = outbound_tx
                            .send(MuxFrame { kind: KIND_CONTROL, stream_id: 0, payload: response })
                            .await;
                    });
                }
                other => tracing::warn!(kind = other, "ignoring unknown tunnel frame kind"),
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    writer.abort();
    viewer_inboxes.clear();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_outbound_frame_uses_the_right_kind() {
        let (tx, _rx) = mpsc::channel(1);
        let outbound = ViewerOutbound { stream_id: 42, outbound: tx };
        assert_eq!(outbound.stream_id, 42);
    }

    #[test]
    fn try_send_reports_full_once_channel_capacity_is_exhausted() {
        let (tx, _rx) = mpsc::channel(1);
        let outbound = ViewerOutbound { stream_id: 1, outbound: tx };
        assert_eq!(outbound.try_send(Bytes::from_static(b"a")), TrySendOutcome::Sent);
        assert_eq!(outbound.try_send(Bytes::from_static(b"b")), TrySendOutcome::Full);
    }

    #[test]
    fn try_send_reports_closed_once_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let outbound = ViewerOutbound { stream_id: 1, outbound: tx };
        assert_eq!(outbound.try_send(Bytes::from_static(b"a")), TrySendOutcome::Closed);
    }
}
