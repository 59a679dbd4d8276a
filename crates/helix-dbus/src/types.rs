//! Types shared by the Supervisor1 and Registry1 D-Bus interfaces, mirroring
//! the Session/Viewer data model (`spec.md` §3) one-for-one.

use serde::{Deserialize, Serialize};
use zbus::zvariant::Type;

/// A session's lifecycle state. Terminal states (`Stopped`, `Failed`) are
/// sticky — enforced at the Registry's single mutation point, not re-checked
/// by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[repr(u8)]
pub enum LifecycleState {
    Pending = 0,
    Starting = 1,
    Ready = 2,
    Draining = 3,
    Stopped = 4,
    Failed = 5,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl LifecycleState {
    /// Whether no further transition out of this state is permitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl TryFrom<u8> for LifecycleState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Starting),
            2 => Ok(Self::Ready),
            3 => Ok(Self::Draining),
            4 => Ok(Self::Stopped),
            5 => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// A session record as exposed over D-Bus (serialized struct, not the full
/// internal `Session` type owned by the Registry).
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner: String,
    pub image_ref: String,
    pub host_id: String,
    pub container_id: String,
    pub lifecycle_state: LifecycleState,
    pub viewer_count: u32,
    pub created_at: i64,
}

/// Reason a `CreateSession`/`StopSession` call failed, mirroring the
/// Sandbox Supervisor's failure semantics (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[repr(u8)]
pub enum SandboxErrorReason {
    ImageUnavailable = 0,
    ContainerStartFailed = 1,
    TunnelTimeout = 2,
    ResourceExhausted = 3,
    UnknownSession = 4,
    InternalError = 5,
}

impl std::fmt::Display for SandboxErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ImageUnavailable => "ImageUnavailable",
            Self::ContainerStartFailed => "ContainerStartFailed",
            Self::TunnelTimeout => "TunnelTimeout",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::UnknownSession => "UnknownSession",
            Self::InternalError => "InternalError",
        };
        write!(f, "{s}")
    }
}

/// Per-host resource advertisement used by `CreateSession` admission control.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Type)]
pub struct HostResources {
    pub gpu_count: u32,
    pub free_encoder_sessions: u32,
    pub free_cpu_cores: u32,
    pub free_ram_mb: u64,
}
