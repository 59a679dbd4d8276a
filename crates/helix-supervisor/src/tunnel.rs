//! Reverse-dialed tunnel acceptance and in-process multiplexing.
//!
//! The container's Edge Server initiates a single TCP connection back to the
//! Supervisor's tunnel-accept port (`spec.md` §4.3 "Tunnel protocol"). That
//! connection carries one control substream plus one substream per attached
//! viewer, each framed as `[kind 1 | stream_id 4 | len 4 | payload]`. The
//! Control Gateway never speaks this framing directly: it dials the
//! Supervisor's relay port with a small `session_id` handshake and the
//! Supervisor bridges the relay connection to a freshly opened viewer
//! substream, so the Gateway's half of the splice
//! (`tokio::io::copy_bidirectional`, the same splice primitive the relay uses)
//! stays completely protocol-unaware.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

const KIND_CONTROL: u8 = 0;
const KIND_VIEWER_OPEN: u8 = 1;
const KIND_VIEWER_DATA: u8 = 2;
const KIND_VIEWER_CLOSE: u8 = 3;

struct MuxFrame {
    kind: u8,
    stream_id: u32,
    payload: Bytes,
}

impl MuxFrame {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(9 + self.payload.len());
        buf.put_u8(self.kind);
        buf.put_u32(self.stream_id);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    async fn read_from(stream: &mut TcpStream) -> Result<Self> {
        let mut header = [0u8; 9];
        stream.read_exact(&mut header).await?;
        let mut cursor = &header[..];
        let kind = cursor.get_u8();
        let stream_id = cursor.get_u32();
        let len = cursor.get_u32() as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(Self { kind, stream_id, payload: Bytes::from(payload) })
    }
}

/// One container's live tunnel connection.
pub struct Tunnel {
    container_id: String,
    outbound: mpsc::Sender<MuxFrame>,
    next_stream_id: AtomicU32,
    viewer_inboxes: Arc<DashMap<u32, mpsc::Sender<Bytes>>>,
    /// The tunnel's single control substream (`spec.md` §4.3: "one control
    /// channel used for health and clipboard HTTP"), keyed separately from
    /// the per-viewer substreams since it is not multiplexed by stream id.
    control_inbox: Arc<tokio::sync::Mutex<Option<mpsc::Sender<Bytes>>>>,
    last_activity_unix: AtomicI64,
}

impl Tunnel {
    /// One-shot request/response exchange over the tunnel's control
    /// substream (`spec.md` §4.3: "one control channel used for health and
    /// clipboard HTTP"). Only one exchange is in flight at a time; a second
    /// call while one is pending waits for the first to vacate the inbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's Edge Server does not answer
    /// within `timeout`.
    pub async fn control_request(&self, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        self.last_activity_unix.store(now_unix(), Ordering::SeqCst);
        let (inbox_tx, mut inbox_rx) = mpsc::channel(1);
        {
            let mut guard = self.control_inbox.lock().await;
            *guard = Some(inbox_tx);
        }

        self.outbound
            .send(MuxFrame { kind: KIND_CONTROL, stream_id: 0, payload })
            .await
            .map_err(|_| anyhow::anyhow!("tunnel outbound channel closed"))?;

        let result = tokio::time::timeout(timeout, inbox_rx.recv())
            .await
            .context("control request timed out")?
            .context("tunnel closed before control response arrived")?;

        *self.control_inbox.lock().await = None;
        Ok(result)
    }

    /// Open a new multiplexed viewer substream and return the channel pair
    /// used to bridge it to a Gateway relay connection.
    pub async fn open_viewer_stream(&self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        self.last_activity_unix.store(now_unix(), Ordering::SeqCst);
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        self.viewer_inboxes.insert(stream_id, inbox_tx);

        let outbound = self.outbound.clone();
        let _ = outbound
            .send(MuxFrame { kind: KIND_VIEWER_OPEN, stream_id, payload: Bytes::new() })
            .await;

        let (to_container_tx, mut to_container_rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            while let Some(chunk) = to_container_rx.recv().await {
                if outbound
                    .send(MuxFrame { kind: KIND_VIEWER_DATA, stream_id, payload: chunk })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = outbound
                .send(MuxFrame { kind: KIND_VIEWER_CLOSE, stream_id, payload: Bytes::new() })
                .await;
        });

        (to_container_tx, inbox_rx)
    }
}

/// Container-id-keyed table of live tunnels, shared across the Supervisor.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, container_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(container_id).map(|e| Arc::clone(e.value()))
    }

    fn remove(&self, container_id: &str) {
        self.tunnels.remove(container_id);
    }

    /// Drop tunnels that have carried no viewer traffic for `idle`
    /// (`spec.md` §3 "Tunnel": "unused tunnels time out after T_idle").
    /// Only tunnels with zero attached viewer substreams are eligible —
    /// an actively-streamed tunnel is never idle regardless of its age.
    pub fn reap_idle(&self, idle: Duration) {
        let cutoff = now_unix() - i64::try_from(idle.as_secs()).unwrap_or(i64::MAX);
        let stale: Vec<String> = self
            .tunnels
            .iter()
            .filter(|entry| {
                let t = entry.value();
                t.viewer_inboxes.is_empty() && t.last_activity_unix.load(Ordering::SeqCst) < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        for container_id in stale {
            tracing::info!(container_id, "reaping idle tunnel");
            self.tunnels.remove(&container_id);
        }
    }
}

/// Accept reverse-dialed tunnel connections from container Edge Servers.
///
/// Each connection starts with a handshake frame on `KIND_CONTROL` whose
/// payload is the UTF-8 `container_id`.
///
/// # Errors
///
/// Returns an error only if binding the listener fails; per-connection
/// errors are logged and do not stop the accept loop.
pub async fn accept_tunnels(bind: &str, registry: TunnelRegistry) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind tunnel accept port {bind}"))?;
    tracing::info!(bind, "tunnel accept port listening");

    loop {
        let (stream, peer) = listener.accept().await.context("tunnel accept failed")?;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = run_tunnel(stream, &registry).await {
                tracing::warn!(%peer, error = %e, "tunnel connection ended");
            }
        });
    }
}

async fn run_tunnel(mut stream: TcpStream, registry: &TunnelRegistry) -> Result<()> {
    let handshake = MuxFrame::read_from(&mut stream).await?;
    if handshake.kind != KIND_CONTROL {
        bail!("expected control handshake as first tunnel frame");
    }
    let container_id = String::from_utf8_lossy(&handshake.payload).to_string();
    tracing::info!(container_id, "tunnel established");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MuxFrame>(256);
    let viewer_inboxes: Arc<DashMap<u32, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let control_inbox: Arc<tokio::sync::Mutex<Option<mpsc::Sender<Bytes>>>> = Arc::new(tokio::sync::Mutex::new(None));

    let tunnel = Arc::new(Tunnel {
        container_id: container_id.clone(),
        outbound: outbound_tx,
        next_stream_id: AtomicU32::new(1),
        viewer_inboxes: Arc::clone(&viewer_inboxes),
        control_inbox: Arc::clone(&control_inbox),
        last_activity_unix: AtomicI64::new(now_unix()),
    });
    registry.tunnels.insert(container_id.clone(), tunnel);

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(&frame.encode()).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match MuxFrame::read_from_half(&mut read_half).await {
            Ok(frame) => match frame.kind {
                KIND_VIEWER_DATA => {
                    if let Some(inbox) = viewer_inboxes.get(&frame.stream_id) {
                        let _ = inbox.send(frame.payload).await;
                    }
                }
                KIND_VIEWER_CLOSE => {
                    viewer_inboxes.remove(&frame.stream_id);
                }
                KIND_CONTROL => {
                    if let Some(inbox) = control_inbox.lock().await.as_ref() {
                        let _ = inbox.send(frame.payload).await;
                    }
                }
                _ => {}
            },
            Err(e) => break Err(e),
        }
    };

    writer.abort();
    registry.remove(&container_id);
    tracing::info!(container_id, "tunnel closed");
    result
}

impl MuxFrame {
    async fn read_from_half(read_half: &mut tokio::net::tcp::OwnedReadHalf) -> Result<Self> {
        let mut header = [0u8; 9];
        read_half.read_exact(&mut header).await?;
        let mut cursor = &header[..];
        let kind = cursor.get_u8();
        let stream_id = cursor.get_u32();
        let len = cursor.get_u32() as usize;
        let mut payload = vec![0u8; len];
        read_half.read_exact(&mut payload).await?;
        Ok(Self { kind, stream_id, payload: Bytes::from(payload) })
    }
}

/// Accept relay connections from the Control Gateway and bridge each one to
/// a freshly opened viewer substream on the named container's tunnel.
///
/// # Errors
///
/// Returns an error only if binding the listener fails.
pub async fn accept_relays(bind: &str, registry: TunnelRegistry) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind relay port {bind}"))?;
    tracing::info!(bind, "gateway relay port listening");

    loop {
        let (mut stream, peer) = listener.accept().await.context("relay accept failed")?;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_relay(&mut stream, &registry).await {
                tracing::warn!(%peer, error = %e, "relay connection ended");
            }
        });
    }
}

/// Relay handshake kind byte: `0` opens a viewer substream (Gateway
/// WebSocket splice), `1` opens the tunnel's single control substream
/// (clipboard HTTP passthrough, `spec.md` §4.3).
const RELAY_KIND_VIEWER: u8 = 0;
const RELAY_KIND_CONTROL: u8 = 1;

/// How long the Supervisor waits for the container's Edge Server to answer
/// a relayed clipboard request before giving up (`spec.md` §4.3).
const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn handle_relay(stream: &mut TcpStream, registry: &TunnelRegistry) -> Result<()> {
    let mut kind_buf = [0u8; 1];
    stream.read_exact(&mut kind_buf).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut id_buf = vec![0u8; len];
    stream.read_exact(&mut id_buf).await?;
    let container_id = String::from_utf8_lossy(&id_buf).to_string();

    let Some(tunnel) = registry.get(&container_id) else {
        bail!("no active tunnel for container {container_id}");
    };

    if kind_buf[0] == RELAY_KIND_CONTROL {
        return handle_relay_control(stream, &tunnel).await;
    }

    let mut negotiation_len_buf = [0u8; 2];
    stream.read_exact(&mut negotiation_len_buf).await?;
    let negotiation_len = u16::from_be_bytes(negotiation_len_buf) as usize;
    let mut negotiation = vec![0u8; negotiation_len];
    stream.read_exact(&mut negotiation).await?;

    let (to_container, mut from_container) = tunnel.open_viewer_stream().await;
    // Forwarded unframed, as its own substream item — the Edge Server reads
    // the first item on a newly opened viewer substream as the negotiation
    // string, everything after as length-framed wire messages.
    let _ = to_container.send(Bytes::from(negotiation)).await;

    let (mut relay_read, mut relay_write) = stream.split();

    // Beyond this point every write on either side is one complete
    // application message. A raw byte-stream splice would let the 8192-byte
    // read buffer below split (or coalesce) video/audio payloads across
    // multiple relay reads, which the Gateway would then forward to the
    // browser as torn WebSocket frames. A length prefix around each relayed
    // message restores the boundary the plain copy loses.
    let upstream = async {
        loop {
            match read_length_framed(&mut relay_read).await {
                Ok(Some(payload)) => {
                    if to_container.send(payload).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let downstream = async {
        while let Some(chunk) = from_container.recv().await {
            write_length_framed(&mut relay_write, &chunk).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    tokio::try_join!(upstream, downstream)?;
    Ok(())
}

/// Read one `[len: u32 BE][payload]` frame, returning `Ok(None)` on a clean
/// EOF between frames (the common "peer closed" case, not an error).
async fn read_length_framed(
    read_half: &mut tokio::net::tcp::ReadHalf<'_>,
) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

async fn write_length_framed(
    write_half: &mut tokio::net::tcp::WriteHalf<'_>,
    payload: &[u8],
) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    write_half.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    write_half.write_all(payload).await
}

/// One-shot clipboard exchange: read a length-prefixed request off the
/// relay connection, forward it over the tunnel's control substream, write
/// the length-prefixed response back, then close. Unlike the viewer kind
/// this never loops — the relay connection serves exactly one request.
async fn handle_relay_control(stream: &mut TcpStream, tunnel: &Tunnel) -> Result<()> {
    let mut req_len_buf = [0u8; 4];
    stream.read_exact(&mut req_len_buf).await?;
    let req_len = u32::from_be_bytes(req_len_buf) as usize;
    let mut req_buf = vec![0u8; req_len];
    stream.read_exact(&mut req_buf).await?;

    let response = tunnel
        .control_request(Bytes::from(req_buf), CONTROL_REQUEST_TIMEOUT)
        .await?;

    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&(response.len() as u32).to_be_bytes()).await?;
    stream.write_all(&response).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_frame_round_trips() {
        let frame = MuxFrame { kind: KIND_VIEWER_DATA, stream_id: 7, payload: Bytes::from_static(b"hello") };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 9 + 5);
        assert_eq!(encoded[0], KIND_VIEWER_DATA);
    }
}
