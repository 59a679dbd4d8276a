//! XDG Desktop Portal `ScreenCast` negotiation.
//!
//! Obtains one `PipeWire` node per monitor (or a single node for the whole
//! virtual desktop, depending on compositor support) plus the `PipeWire`
//! remote file descriptor the capture thread connects through.

use std::os::fd::OwnedFd;

use ashpd::desktop::screencast::{CursorMode, PersistMode, ScreenCast, SourceType};
use ashpd::enumflags2::BitFlags;

/// One monitor stream negotiated through the portal.
#[derive(Debug, Clone)]
pub struct PortalStreamInfo {
    pub node_id: u32,
    /// Position in the compositor's virtual desktop, if advertised.
    pub position: Option<(i32, i32)>,
    /// Stream size, if advertised.
    pub size: Option<(i32, i32)>,
}

/// A negotiated `ScreenCast` session: the `PipeWire` remote fd plus the set
/// of monitor streams available on it.
pub struct PortalSession {
    pub pipewire_fd: OwnedFd,
    pub streams: Vec<PortalStreamInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("failed to connect to the ScreenCast portal: {0}")]
    Connect(#[source] ashpd::Error),
    #[error("failed to create a portal session: {0}")]
    CreateSession(#[source] ashpd::Error),
    #[error("failed to select capture sources: {0}")]
    SelectSources(#[source] ashpd::Error),
    #[error("the user cancelled or denied the capture request")]
    Denied,
    #[error("failed to start the capture session: {0}")]
    Start(#[source] ashpd::Error),
    #[error("failed to open the PipeWire remote: {0}")]
    OpenRemote(#[source] ashpd::Error),
}

/// Request a `ScreenCast` session covering every available monitor.
///
/// `cursor_mode` selects whether the compositor embeds the cursor in the
/// video frames (`CursorMode::Embedded`) or delivers it out-of-band via SPA
/// metadata (`CursorMode::Metadata`, preferred here so the cursor can be
/// positioned independently per viewer viewport).
///
/// # Errors
///
/// Returns [`PortalError`] if the portal is unreachable, the user denies the
/// request, or negotiation otherwise fails.
pub async fn request_screencast() -> Result<PortalSession, PortalError> {
    let proxy = ScreenCast::new().await.map_err(PortalError::Connect)?;
    let session = proxy
        .create_session()
        .await
        .map_err(PortalError::CreateSession)?;

    proxy
        .select_sources(
            &session,
            CursorMode::Metadata,
            BitFlags::from(SourceType::Monitor),
            true, // multiple monitors in one session
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(PortalError::SelectSources)?;

    let response = proxy
        .start(&session, None)
        .await
        .map_err(PortalError::Start)?
        .response()
        .map_err(|_| PortalError::Denied)?;

    let streams = response
        .streams()
        .iter()
        .map(|s| PortalStreamInfo {
            node_id: s.pipe_wire_node_id(),
            position: s.position(),
            size: s.size(),
        })
        .collect();

    let pipewire_fd = proxy
        .open_pipe_wire_remote(&session)
        .await
        .map_err(PortalError::OpenRemote)?;

    Ok(PortalSession {
        pipewire_fd,
        streams,
    })
}
