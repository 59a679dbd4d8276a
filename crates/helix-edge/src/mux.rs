//! Tunnel multiplexing frame, wire-compatible with `helix-supervisor`'s
//! `tunnel.rs` (`[kind 1 | stream_id 4 | len 4 | payload]`). Duplicated here
//! rather than shared via a library crate since the Supervisor is a
//! bin-only crate; the two copies must be kept in sync by hand if the
//! framing ever changes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub const KIND_CONTROL: u8 = 0;
pub const KIND_VIEWER_OPEN: u8 = 1;
pub const KIND_VIEWER_DATA: u8 = 2;
pub const KIND_VIEWER_CLOSE: u8 = 3;

#[derive(Debug, Clone)]
pub struct MuxFrame {
    pub kind: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(9 + self.payload.len());
        buf.put_u8(self.kind);
        buf.put_u32(self.stream_id);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub async fn write_to(&self, write_half: &mut OwnedWriteHalf) -> std::io::Result<()> {
        write_half.write_all(&self.encode()).await
    }

    /// Returns `Ok(None)` on a clean EOF between frames — the tunnel peer
    /// closed the connection, not a protocol violation.
    pub async fn read_from(read_half: &mut OwnedReadHalf) -> std::io::Result<Option<Self>> {
        let mut header = [0u8; 9];
        match read_half.read_exact(&mut header).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut cursor = &header[..];
        let kind = cursor.get_u8();
        let stream_id = cursor.get_u32();
        let len = cursor.get_u32() as usize;
        let mut payload = vec![0u8; len];
        read_half.read_exact(&mut payload).await?;
        Ok(Some(Self { kind, stream_id, payload: Bytes::from(payload) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_header_layout() {
        let frame = MuxFrame { kind: KIND_VIEWER_DATA, stream_id: 3, payload: Bytes::from_static(b"hi") };
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 9 + 2);
        assert_eq!(encoded[0], KIND_VIEWER_DATA);
        assert_eq!(u32::from_be_bytes(encoded[1..5].try_into().unwrap()), 3);
        assert_eq!(u32::from_be_bytes(encoded[5..9].try_into().unwrap()), 2);
    }
}
