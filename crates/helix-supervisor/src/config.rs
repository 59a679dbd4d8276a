use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Container runtime CLI to shell out to. Probed at startup if `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Auto,
    Podman,
    Docker,
}

impl ContainerRuntime {
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::Auto | Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }
}

/// This host's advertised resource budget, used by `CreateSession` admission
/// control (`spec.md` §4.3 "Resource accounting").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCapacity {
    pub gpu_count: u32,
    pub nvenc_sessions: u32,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub disk_quota_gb: u64,
}

impl Default for HostCapacity {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            nvenc_sessions: 8,
            cpu_cores: 16,
            ram_mb: 65_536,
            disk_quota_gb: 200,
        }
    }
}

/// Supervisor configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// This host's identifier, used as `host_id` in every session record.
    pub host_id: String,

    /// Container runtime CLI selection.
    pub runtime: ContainerRuntime,

    /// Address the reverse-dialed Edge Server tunnel listener binds to.
    pub tunnel_bind: String,

    /// Address the Control Gateway's relay connections are accepted on.
    pub relay_bind: String,

    /// This host's advertised resource budget.
    pub capacity: HostCapacity,

    /// Seconds between `HealthLoop` probes (`T_probe`).
    pub probe_interval_secs: u64,

    /// Seconds before a `Draining` session is force-killed (`T_drain`).
    pub drain_timeout_secs: u64,

    /// Seconds to wait for the tunnel dial-back after container start
    /// (`T_dial`).
    pub dial_timeout_secs: u64,

    /// Seconds to wait for a broken tunnel to re-accept before failing the
    /// session (`T_redial`).
    pub redial_timeout_secs: u64,

    /// Seconds an idle (no attached viewer) tunnel may live before `Reap`
    /// removes it (`T_idle`).
    pub idle_tunnel_secs: u64,

    /// Seconds an exited-but-not-removed container may live before `Reap`
    /// removes it (`T_reap`).
    pub reap_exited_secs: u64,

    /// Path to the persisted session snapshot (JSON), reconciled against
    /// live container inventory on boot per `spec.md` §6.4.
    pub state_file: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host_id: "host-0".to_string(),
            runtime: ContainerRuntime::Auto,
            tunnel_bind: "127.0.0.1:7700".to_string(),
            relay_bind: "127.0.0.1:7701".to_string(),
            capacity: HostCapacity::default(),
            probe_interval_secs: 5,
            drain_timeout_secs: 15,
            dial_timeout_secs: 30,
            redial_timeout_secs: 10,
            idle_tunnel_secs: 120,
            reap_exited_secs: 60,
            state_file: PathBuf::from("/var/lib/helix-supervisor/sessions.json"),
        }
    }
}

/// Load the supervisor configuration from a TOML file, falling back to
/// [`SupervisorConfig::default`] when the file is absent, then overlaying
/// `HELIX__`-prefixed environment variables.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed, or if
/// an environment override fails to parse into the target field's type.
pub fn load(path: Option<&Path>) -> Result<SupervisorConfig> {
    let path = path.map_or_else(|| PathBuf::from("/etc/helix/supervisor.toml"), Path::to_path_buf);

    let file_config = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read supervisor config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse supervisor config: {}", path.display()))?
    } else {
        tracing::debug!(?path, "supervisor config not found, using defaults");
        SupervisorConfig::default()
    };

    let merged = config::Config::builder()
        .add_source(config::Config::try_from(&file_config).context("failed to stage defaults")?)
        .add_source(
            config::Environment::with_prefix("HELIX")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to layer environment overrides")?;

    merged
        .try_deserialize()
        .context("failed to deserialize merged supervisor config")
}
