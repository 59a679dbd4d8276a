//! Thin client over the Session Registry's `dev.helix.Registry1` D-Bus
//! interface, used by every upgrade on `GET /stream/{session_id}`
//! (`spec.md` §4.4, §4.5 "`Lookup` used by the Gateway on every viewer
//! upgrade").

use anyhow::{Context, Result};
use helix_dbus::types::SessionRecord;
use helix_dbus::Registry1Proxy;

#[derive(Clone)]
pub struct RegistryClient {
    proxy: Registry1Proxy<'static>,
}

impl RegistryClient {
    /// Connect to the Registry1 interface on the system bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the system bus connection or proxy construction
    /// fails.
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .context("failed to connect to system D-Bus")?;
        let proxy = Registry1Proxy::new(&connection)
            .await
            .context("failed to build Registry1 proxy")?;
        Ok(Self { proxy })
    }

    /// `Lookup(session_id)`. Returns `None` on an unknown session or a
    /// malformed reply.
    pub async fn lookup(&self, session_id: &str) -> Option<SessionRecord> {
        let json = self.proxy.lookup(session_id).await.ok()?;
        if json.is_empty() {
            return None;
        }
        serde_json::from_str(&json).ok()
    }

    /// Report the attached-viewer count the Gateway currently observes for
    /// a session, so `Lookup`/`list` reflect live viewer attachment.
    pub async fn set_viewer_count(&self, session_id: &str, count: u32) {
        if let Err(e) = self.proxy.set_viewer_count(session_id, count).await {
            tracing::debug!(session_id, error = %e, "failed to report viewer count to registry");
        }
    }
}
