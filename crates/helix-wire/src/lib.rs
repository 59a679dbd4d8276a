//! Binary wire protocol spoken over the viewer WebSocket.
//!
//! Every message is a single binary WebSocket frame. The first byte is
//! always the message type; all multi-byte integers are big-endian. The
//! protocol is not versioned in this cut — negotiation changes require a
//! breaking release.

mod codec;
mod error;
mod message;
mod reason;

pub use codec::CodecId;
pub use error::WireError;
pub use message::{ControllerEventKind, Message, MessageType};
pub use reason::StreamErrorReason;
