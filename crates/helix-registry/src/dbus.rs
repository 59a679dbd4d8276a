//! `dev.helix.Registry1` D-Bus server wiring over the in-memory [`Catalog`].

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use helix_dbus::types::{HostResources, LifecycleState, SessionRecord};
use helix_dbus::{RegistryBackend, RegistryInterface};

use crate::catalog::Catalog;

pub struct CatalogBackend {
    catalog: Catalog,
}

impl CatalogBackend {
    #[must_use]
    pub const fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl RegistryBackend for CatalogBackend {
    async fn lookup(&self, session_id: &str) -> Option<SessionRecord> {
        self.catalog.lookup(session_id).await.map(|e| e.to_record())
    }

    async fn list(&self) -> Vec<SessionRecord> {
        self.catalog.list().await.iter().map(crate::catalog::SessionEntry::to_record).collect()
    }

    async fn host_resources(&self, host_id: &str) -> Option<HostResources> {
        self.catalog.host_resources(host_id)
    }

    async fn register(&self, record: SessionRecord) -> bool {
        self.catalog.register(record).await
    }

    async fn transition(&self, session_id: &str, state: LifecycleState, reason: Option<String>) -> bool {
        self.catalog.transition(session_id, state, reason).await
    }

    async fn renew_lease(&self, session_id: &str, host_id: &str) -> bool {
        self.catalog.renew_lease(session_id, host_id).await
    }

    async fn set_viewer_count(&self, session_id: &str, count: u32) -> bool {
        self.catalog.set_viewer_count(session_id, count).await
    }
}

/// Start the `dev.helix.Registry1` server on the system bus.
///
/// # Errors
///
/// Returns an error if the system bus connection or name registration
/// fails.
pub async fn start(catalog: Catalog) -> Result<zbus::Connection> {
    let backend = Arc::new(CatalogBackend::new(catalog));
    let iface = RegistryInterface::new(backend);

    let connection = zbus::connection::Builder::system()
        .context("failed to connect to system D-Bus")?
        .name(helix_dbus::constants::REGISTRY_SERVICE_NAME)
        .context("failed to request Registry1 D-Bus name")?
        .serve_at(helix_dbus::constants::REGISTRY_OBJECT_PATH, iface)
        .context("failed to serve Registry1 D-Bus interface")?
        .build()
        .await
        .context("failed to build Registry1 D-Bus connection")?;

    tracing::info!(
        service = helix_dbus::constants::REGISTRY_SERVICE_NAME,
        "Registry1 D-Bus interface registered on system bus"
    );
    Ok(connection)
}
