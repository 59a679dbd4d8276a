//! `dev.helix.Supervisor1` D-Bus server wiring: implements
//! [`helix_dbus::SupervisorBackend`] over this host's [`SessionTable`] and
//! [`TunnelRegistry`], matching a backend-trait-object interface server wrapping a
//! `SessionRegistry`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use helix_dbus::types::SandboxErrorReason;
use helix_dbus::{SupervisorBackend, SupervisorInterface};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::lifecycle;
use crate::session::{ResourceRequest, SessionTable};
use crate::tunnel::TunnelRegistry;

pub struct HostSupervisorBackend {
    cfg: SupervisorConfig,
    table: SessionTable,
    tunnels: TunnelRegistry,
}

impl HostSupervisorBackend {
    #[must_use]
    pub const fn new(cfg: SupervisorConfig, table: SessionTable, tunnels: TunnelRegistry) -> Self {
        Self { cfg, table, tunnels }
    }
}

#[async_trait]
impl SupervisorBackend for HostSupervisorBackend {
    async fn create_session(
        &self,
        owner: &str,
        image_ref: &str,
    ) -> Result<String, SandboxErrorReason> {
        let session_id = Uuid::new_v4().to_string();
        // Default resource shape until the control plane's request carries
        // one explicitly — the D-Bus signature in `spec.md` §4.3 only names
        // `spec` opaquely, so the concrete resource request fields are an
        // ambient addition (see DESIGN.md).
        let resources = ResourceRequest {
            cpu_cores: 4,
            ram_mb: 8192,
            gpu_vendor: "nvidia".to_string(),
            disk_quota_gb: 20,
        };
        lifecycle::create_session(
            &self.cfg,
            &self.table,
            &self.tunnels,
            session_id.clone(),
            owner.to_string(),
            image_ref.to_string(),
            resources,
        )
        .await?;
        Ok(session_id)
    }

    async fn stop_session(&self, session_id: &str, reason: &str) -> Result<(), SandboxErrorReason> {
        if self.table.get(session_id).await.is_none() {
            return Err(SandboxErrorReason::UnknownSession);
        }
        lifecycle::stop_session(&self.cfg, &self.table, session_id, reason).await;
        Ok(())
    }

    async fn list_sessions(&self) -> Vec<String> {
        self.table.list().await.into_iter().map(|s| s.session_id).collect()
    }
}

/// Start the `dev.helix.Supervisor1` server on the system bus.
///
/// # Errors
///
/// Returns an error if the system bus connection or name registration
/// fails.
pub async fn start(
    cfg: SupervisorConfig,
    table: SessionTable,
    tunnels: TunnelRegistry,
) -> Result<zbus::Connection> {
    let backend = Arc::new(HostSupervisorBackend::new(cfg, table, tunnels));
    let iface = SupervisorInterface::new(backend);

    let connection = zbus::connection::Builder::system()
        .context("failed to connect to system D-Bus")?
        .name(helix_dbus::constants::SUPERVISOR_SERVICE_NAME)
        .context("failed to request Supervisor1 D-Bus name")?
        .serve_at(helix_dbus::constants::SUPERVISOR_OBJECT_PATH, iface)
        .context("failed to serve Supervisor1 D-Bus interface")?
        .build()
        .await
        .context("failed to build Supervisor1 D-Bus connection")?;

    tracing::info!(
        service = helix_dbus::constants::SUPERVISOR_SERVICE_NAME,
        "Supervisor1 D-Bus interface registered on system bus"
    );
    Ok(connection)
}
