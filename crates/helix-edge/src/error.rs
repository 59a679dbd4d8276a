/// Errors surfaced at the Edge Server's public boundary (`spec.md` §4.2,
/// §7). Per-viewer protocol violations never reach this type — those are
/// logged-and-dropped or escalated to a `StreamError` frame directly, per
/// the spec's "not a reason to close the connection outright" rule.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("failed to dial the Sandbox Supervisor's tunnel port")]
    TunnelDial(#[source] std::io::Error),
    #[error("tunnel connection lost")]
    TunnelLost,
    #[error("no codec satisfies both the host encoders and the viewer's capability bits")]
    NoCompatibleCodec,
    #[error("capture pipeline unavailable")]
    SourceUnavailable,
    #[error("video encoder faulted")]
    EncoderFault,
    #[error("input injector unavailable")]
    InputUnavailable(#[source] anyhow::Error),
    #[error("unknown session for clipboard/screenshot request")]
    UnknownSession,
}
