use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Registry configuration loaded from TOML, overlaid by `HELIX__`-prefixed
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Cadence the owning Supervisor is expected to call `RenewLease` at
    /// (`spec.md` §4.5: `T_lease_renew = 5s`). Informational here — the
    /// Registry only enforces `lease_expire_secs`.
    pub lease_renew_secs: u64,
    /// A missed renewal beyond this window fails the session
    /// (`spec.md` §4.5: `T_lease_expire = 20s`).
    pub lease_expire_secs: u64,
    /// How often the lease-expiry sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_renew_secs: 5,
            lease_expire_secs: 20,
            sweep_interval_secs: 5,
        }
    }
}

pub fn load(path: Option<&Path>) -> Result<RegistryConfig> {
    let path = path.map_or_else(|| PathBuf::from("/etc/helix/registry.toml"), Path::to_path_buf);

    let file_config = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read registry config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse registry config: {}", path.display()))?
    } else {
        tracing::debug!(?path, "registry config not found, using defaults");
        RegistryConfig::default()
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
        .context("failed to deserialize merged registry config")
}
