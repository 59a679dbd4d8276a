/// Decode-time failures for an inbound wire frame.
///
/// Per `spec.md` §4.2: any inbound frame that violates the protocol (unknown
/// type, undersized payload, impossible sub-type) is logged and dropped, not
/// a reason to close the connection outright — the caller decides the
/// close/drop policy based on violation rate, this type only reports what
/// went wrong.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame too short for type 0x{0:02x}: need {1} bytes, got {2}")]
    Undersized(u8, usize, usize),
    #[error("impossible sub-type 0x{0:02x} for message type 0x{1:02x}")]
    BadSubType(u8, u8),
    #[error("message string is not valid UTF-8")]
    InvalidUtf8,
}
