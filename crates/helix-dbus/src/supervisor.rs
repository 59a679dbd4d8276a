//! `dev.helix.Supervisor1` D-Bus interface and proxy.
//!
//! The interface is generic over a [`SupervisorBackend`] trait object so the
//! wire-level plumbing lives here while `helix-supervisor` owns the actual
//! container lifecycle logic, mirroring a backend-trait-object interface server
//! wrapping a `SessionRegistry`.

use std::sync::Arc;

use async_trait::async_trait;
use zbus::interface;

use crate::types::SandboxErrorReason;

/// Business logic the Supervisor1 interface delegates to.
#[async_trait]
pub trait SupervisorBackend: Send + Sync + 'static {
    /// `CreateSession(spec) -> SessionHandle | ErrSandbox` (`spec.md` §4.3).
    async fn create_session(
        &self,
        owner: &str,
        image_ref: &str,
    ) -> Result<String, SandboxErrorReason>;

    /// `StopSession(session_id, reason)`.
    async fn stop_session(&self, session_id: &str, reason: &str) -> Result<(), SandboxErrorReason>;

    /// List session ids currently known to this host's Supervisor.
    async fn list_sessions(&self) -> Vec<String>;
}

/// Server-side `dev.helix.Supervisor1` implementation.
pub struct SupervisorInterface {
    backend: Arc<dyn SupervisorBackend>,
}

impl SupervisorInterface {
    #[must_use]
    pub fn new(backend: Arc<dyn SupervisorBackend>) -> Self {
        Self { backend }
    }
}

#[interface(name = "dev.helix.Supervisor1")]
impl SupervisorInterface {
    /// Create a new session, returning its `session_id`.
    async fn create_session(
        &self,
        owner: &str,
        image_ref: &str,
    ) -> zbus::fdo::Result<String> {
        self.backend
            .create_session(owner, image_ref)
            .await
            .map_err(|reason| zbus::fdo::Error::Failed(reason.to_string()))
    }

    /// Stop a session by id, with a human-readable reason for audit logs.
    async fn stop_session(&self, session_id: &str, reason: &str) -> zbus::fdo::Result<()> {
        self.backend
            .stop_session(session_id, reason)
            .await
            .map_err(|reason| zbus::fdo::Error::Failed(reason.to_string()))
    }

    /// List every session id this host's Supervisor currently tracks.
    async fn list_sessions(&self) -> Vec<String> {
        self.backend.list_sessions().await
    }

    /// Emitted whenever a session transitions lifecycle state.
    #[zbus(signal)]
    pub async fn session_state_changed(
        signal_ctxt: &zbus::object_server::SignalEmitter<'_>,
        session_id: &str,
        state: u8,
    ) -> zbus::Result<()>;
}

/// Client-side proxy for the control plane / Control Gateway to call into a
/// host's Supervisor.
#[zbus::proxy(
    interface = "dev.helix.Supervisor1",
    default_service = "dev.helix.Supervisor1",
    default_path = "/dev/helix/Supervisor1"
)]
pub trait Supervisor1 {
    fn create_session(&self, owner: &str, image_ref: &str) -> zbus::Result<String>;
    fn stop_session(&self, session_id: &str, reason: &str) -> zbus::Result<()>;
    fn list_sessions(&self) -> zbus::Result<Vec<String>>;

    #[zbus(signal)]
    fn session_state_changed(&self, session_id: &str, state: u8) -> zbus::Result<()>;
}
