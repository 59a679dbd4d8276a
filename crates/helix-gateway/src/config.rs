use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Control Gateway configuration loaded from TOML, overlaid by
/// `HELIX__`-prefixed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Bearer tokens accepted in `Authorization: Bearer <token>`, mapped to
    /// a principal id used for rate limiting. Ambient placeholder for the
    /// control plane's real identity check, which is out of scope
    /// (`spec.md` §1 "Out of scope: Identity, authorization").
    pub bearer_tokens: Vec<BearerToken>,
    /// `T_wait` (`spec.md` §4.4): how long an upgrade may be held while a
    /// session is `Pending`/`Starting`.
    pub wait_timeout_secs: u64,
    /// Per-principal reconnect rate limit (`spec.md` §4.4: 16/s).
    pub rate_limit_per_sec: u32,
    pub relay_connect_timeout_secs: u64,
    /// Each host's Supervisor relay-accept address, keyed by `host_id`
    /// (`spec.md` §2's control-flow diagram has the Registry tell the
    /// Gateway only `host_id`; resolving that to a dialable address is an
    /// operator-provided mapping, since live service discovery is contracted
    /// out to the enclosing control plane per `spec.md` §1).
    pub host_relay_addrs: HashMap<String, SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerToken {
    pub token: String,
    pub principal: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8443".parse().expect("valid default bind address"),
            tls_cert: None,
            tls_key: None,
            bearer_tokens: Vec::new(),
            wait_timeout_secs: 20,
            rate_limit_per_sec: 16,
            relay_connect_timeout_secs: 5,
            host_relay_addrs: HashMap::new(),
        }
    }
}

pub fn load(path: Option<&Path>) -> Result<GatewayConfig> {
    let path = path.map_or_else(|| PathBuf::from("/etc/helix/gateway.toml"), Path::to_path_buf);

    let file_config = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read gateway config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse gateway config: {}", path.display()))?
    } else {
        tracing::debug!(?path, "gateway config not found, using defaults");
        GatewayConfig::default()
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
        .context("failed to deserialize merged gateway config")
}
