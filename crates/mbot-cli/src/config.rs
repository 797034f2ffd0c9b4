//! Settings file – reads the bridge's TOML configuration.
//!
//! The file holds every [`BridgeConfig`] field at the top level plus the
//! listening `port`.  A missing file is not an error; the caller falls back
//! to defaults.

use std::fs;
use std::path::Path;

use mbot_middleware::BridgeConfig;
use mbot_server::DEFAULT_PORT;
use mbot_types::BridgeError;
use serde::{Deserialize, Serialize};

/// Everything the binary reads from its configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// TCP port for WebSocket clients.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(flatten)]
    pub bridge: BridgeConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Load the settings from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Settings>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
    let settings = parse(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(settings))
}

fn parse(raw: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(raw)
}

/// Apply `MBOT_BRIDGE_*` environment variable overrides to `settings`.
///
/// | Variable | Setting |
/// |---|---|
/// | `MBOT_BRIDGE_LCM_ADDRESS` | `lcm_address` |
/// | `MBOT_BRIDGE_STALE_SECS` | `stale_after_secs` |
/// | `MBOT_BRIDGE_PORT` | `port` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("MBOT_BRIDGE_LCM_ADDRESS") {
        settings.bridge.lcm_address = v;
    }
    if let Ok(v) = std::env::var("MBOT_BRIDGE_STALE_SECS")
        && let Ok(secs) = v.trim().parse::<f64>()
    {
        settings.bridge.stale_after_secs = secs;
    }
    if let Ok(v) = std::env::var("MBOT_BRIDGE_PORT")
        && let Ok(port) = v.trim().parse::<u16>()
    {
        settings.port = port;
    }
}

/// Read the robot's hostname from `path`, trimmed of surrounding whitespace.
pub fn read_hostname(path: &Path) -> Result<String, std::io::Error> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}
