//! `dev.helix.Registry1` D-Bus interface and proxy.

use std::sync::Arc;

use async_trait::async_trait;
use zbus::interface;

use crate::types::{HostResources, LifecycleState, SessionRecord};

/// Business logic the Registry1 interface delegates to.
#[async_trait]
pub trait RegistryBackend: Send + Sync + 'static {
    async fn lookup(&self, session_id: &str) -> Option<SessionRecord>;
    async fn list(&self) -> Vec<SessionRecord>;
    async fn host_resources(&self, host_id: &str) -> Option<HostResources>;

    /// Add a freshly created session to the catalog. Returns `false` if the
    /// `session_id` is already present.
    async fn register(&self, record: SessionRecord) -> bool;

    /// Move a session to a new lifecycle state (`spec.md` §4.5 CRUD).
    /// Returns `false` for an unknown session; terminal-state stickiness is
    /// enforced at the catalog's single mutation point regardless of the
    /// caller's request.
    async fn transition(&self, session_id: &str, state: LifecycleState, reason: Option<String>) -> bool;

    /// `RenewLease(session_id, host_id)` (`spec.md` §4.5). Returns `false` if
    /// the session is unknown or owned by a different host.
    async fn renew_lease(&self, session_id: &str, host_id: &str) -> bool;

    /// Update the attached-viewer count the Gateway reports for a session.
    async fn set_viewer_count(&self, session_id: &str, count: u32) -> bool;
}

/// Server-side `dev.helix.Registry1` implementation.
pub struct RegistryInterface {
    backend: Arc<dyn RegistryBackend>,
}

impl RegistryInterface {
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }
}

#[interface(name = "dev.helix.Registry1")]
impl RegistryInterface {
    /// Look up one session by id; returns an empty session id on miss since
    /// D-Bus has no native `Option`.
    async fn lookup(&self, session_id: &str) -> String {
        self.backend
            .lookup(session_id)
            .await
            .and_then(|record| serde_json::to_string(&record).ok())
            .unwrap_or_default()
    }

    /// List every tracked session as a JSON array.
    async fn list(&self) -> String {
        let records = self.backend.list().await;
        serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string())
    }

    /// Number of sessions currently tracked.
    #[zbus(property)]
    async fn session_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.backend.list().await.len() as u32;
        count
    }

    /// Register a newly created session. `record_json` is a
    /// serialized [`SessionRecord`]; malformed JSON is treated as a no-op
    /// registration failure.
    async fn register(&self, record_json: &str) -> bool {
        let Ok(record) = serde_json::from_str::<SessionRecord>(record_json) else {
            return false;
        };
        self.backend.register(record).await
    }

    /// Transition a session to `state` (see [`LifecycleState`]'s `repr(u8)`
    /// ordering), with an optional human-readable reason.
    async fn transition(&self, session_id: &str, state: u8, reason: &str) -> bool {
        let Ok(state) = LifecycleState::try_from(state) else {
            return false;
        };
        let reason = if reason.is_empty() { None } else { Some(reason.to_string()) };
        self.backend.transition(session_id, state, reason).await
    }

    /// `RenewLease(session_id, host_id)`.
    async fn renew_lease(&self, session_id: &str, host_id: &str) -> bool {
        self.backend.renew_lease(session_id, host_id).await
    }

    /// Update the Gateway-reported attached-viewer count for a session.
    async fn set_viewer_count(&self, session_id: &str, count: u32) -> bool {
        self.backend.set_viewer_count(session_id, count).await
    }

    /// Emitted when a session is added to or removed from the catalog.
    #[zbus(signal)]
    pub async fn catalog_changed(
        signal_ctxt: &zbus::object_server::SignalEmitter<'_>,
        session_id: &str,
        present: bool,
    ) -> zbus::Result<()>;
}

/// Client-side proxy used by the Supervisor and the Control Gateway to
/// resolve `session_id -> {container_id, host_id, tunnel_id}`.
#[zbus::proxy(
    interface = "dev.helix.Registry1",
    default_service = "dev.helix.Registry1",
    default_path = "/dev/helix/Registry1"
)]
pub trait Registry1 {
    fn lookup(&self, session_id: &str) -> zbus::Result<String>;
    fn list(&self) -> zbus::Result<String>;
    fn register(&self, record_json: &str) -> zbus::Result<bool>;
    fn transition(&self, session_id: &str, state: u8, reason: &str) -> zbus::Result<bool>;
    fn renew_lease(&self, session_id: &str, host_id: &str) -> zbus::Result<bool>;
    fn set_viewer_count(&self, session_id: &str, count: u32) -> zbus::Result<bool>;

    #[zbus(property)]
    fn session_count(&self) -> zbus::Result<u32>;

    #[zbus(signal)]
    fn catalog_changed(&self, session_id: &str, present: bool) -> zbus::Result<()>;
}
