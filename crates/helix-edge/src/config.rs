use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Edge Server configuration loaded from TOML file, overlaid with
/// `HELIX__`-prefixed environment variables.
///
/// `tunnel_addr` is normally supplied by the Supervisor via the
/// `HELIX_TUNNEL_ADDR` environment variable it sets on container launch
/// (`helix-supervisor`'s `spawner.rs`); the config file value is only a
/// fallback for running the Edge Server outside a Supervisor-managed
/// container (local development).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Address of the Supervisor's reverse-dial tunnel-accept port.
    pub tunnel_addr: String,

    /// Bind address for the local, non-tunneled HTTP surface (`spec.md`
    /// §4.2: "for agents that don't open a WebSocket").
    pub local_http_bind: String,

    /// Default audio sample rate used for viewers whose negotiation query
    /// doesn't request one explicitly (the wire handshake only carries
    /// codec/resolution/fps/touch, not audio parameters).
    pub default_audio_sample_rate: u32,
    pub default_audio_channels: u16,
    pub default_bitrate_ceiling_kbps: u32,

    /// Fallback capture resolution/fps when the negotiation query omits
    /// them.
    pub default_width: u32,
    pub default_height: u32,
    pub default_fps: u32,

    /// Seconds a viewer may go with neither a ping nor forwarded frame
    /// progress before being closed (`spec.md` §4.2 `T_stall`).
    pub stall_timeout_secs: u64,

    /// Malformed inbound frames per second before a viewer connection is
    /// closed with `MalformedProtocol` (`spec.md` §4.2).
    pub malformed_rate_limit_per_sec: u32,

    /// Consecutive-30s encoder fault count before a viewer is sent
    /// `StreamError(EncoderFault)` and closed (`spec.md` §4.2).
    pub encoder_fault_limit: u32,
    pub encoder_fault_window_secs: u64,

    /// Seconds between native-clipboard polls for remote→local sync
    /// (`spec.md` §4.2: "polls the native clipboard at 2 Hz").
    pub clipboard_poll_hz: f64,

    /// Seconds to wait before retrying a dropped tunnel dial-out.
    pub tunnel_redial_backoff_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: "127.0.0.1:7700".to_string(),
            local_http_bind: "127.0.0.1:7800".to_string(),
            default_audio_sample_rate: 48_000,
            default_audio_channels: 2,
            default_bitrate_ceiling_kbps: 8_000,
            default_width: 1920,
            default_height: 1080,
            default_fps: 60,
            stall_timeout_secs: 10,
            malformed_rate_limit_per_sec: 10,
            encoder_fault_limit: 3,
            encoder_fault_window_secs: 30,
            clipboard_poll_hz: 2.0,
            tunnel_redial_backoff_secs: 5,
        }
    }
}

/// Load the Edge Server configuration from a TOML file, falling back to
/// [`EdgeConfig::default`] when the file is absent, then overlaying
/// `HELIX__`-prefixed environment variables (the `HELIX_TUNNEL_ADDR` shape
/// the Supervisor sets is handled separately by the caller, which takes
/// priority over both the file and the `HELIX__TUNNEL_ADDR` form).
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed, or if
/// an environment override fails to parse into the target field's type.
pub fn load(path: Option<&Path>) -> Result<EdgeConfig> {
    let path = path.map_or_else(|| PathBuf::from("/etc/helix/edge.toml"), Path::to_path_buf);

    let file_config: EdgeConfig = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read edge config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse edge config: {}", path.display()))?
    } else {
        tracing::debug!(?path, "edge config not found, using defaults");
        EdgeConfig::default()
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

    merged.try_deserialize().context("failed to deserialize merged edge config")
}
