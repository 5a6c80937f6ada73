//! Configuration for the Fleetlink relay.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Config file (JSON), when given
//! 3. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Fleetlink relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub recordings: RecordingConfig,
}

/// Relay process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP listener binds to.
    pub listen_addr: String,
    /// Path to the SQLite database file; in-memory when absent.
    pub database_path: Option<PathBuf>,
    /// Identifier of this instance within the fleet; generated when absent.
    pub instance_id: Option<String>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: None,
            instance_id: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Session and link supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between watchdog pings on a live link (seconds).
    pub ping_period_secs: u64,
    /// Consecutive missed pongs before a link is declared dead.
    pub missed_pong_limit: u32,
    /// Deadline for a device to acknowledge a new session (seconds).
    pub open_timeout_secs: u64,
    /// Deadline for synchronous control requests (seconds).
    pub control_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_period_secs: 30,
            missed_pong_limit: 3,
            open_timeout_secs: 10,
            control_timeout_secs: 10,
        }
    }
}

/// Session recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Retention of stored recordings (seconds).
    pub expire_secs: i64,
    /// Target size of a flushed compressed chunk (bytes).
    pub chunk_bytes: usize,
    /// Capacity of the recorder's frame queue.
    pub queue_frames: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            expire_secs: 7 * 24 * 60 * 60,
            chunk_bytes: 4096,
            queue_frames: 64,
        }
    }
}

/// Load configuration from an optional JSON file, then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FLEETLINK_LISTEN_ADDR") {
        config.relay.listen_addr = val;
    }
    if let Ok(val) = std::env::var("FLEETLINK_DB_PATH") {
        config.relay.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("FLEETLINK_INSTANCE_ID") {
        config.relay.instance_id = Some(val);
    }
    if let Ok(val) = std::env::var("FLEETLINK_LOG_LEVEL") {
        config.relay.log_level = val;
    }
    if let Ok(val) = std::env::var("FLEETLINK_PING_PERIOD_SECS") {
        if let Ok(n) = val.parse() {
            config.sessions.ping_period_secs = n;
        }
    }
    if let Ok(val) = std::env::var("FLEETLINK_RECORDING_EXPIRE_SECS") {
        if let Ok(n) = val.parse() {
            config.recordings.expire_secs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_30s_ping_period() {
        let config = Config::default();
        assert_eq!(config.sessions.ping_period_secs, 30);
        assert_eq!(config.sessions.missed_pong_limit, 3);
    }

    #[test]
    fn default_config_has_7_day_recording_retention() {
        let config = Config::default();
        assert_eq!(config.recordings.expire_secs, 7 * 24 * 60 * 60);
        assert_eq!(config.recordings.chunk_bytes, 4096);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"relay": {"listen_addr": "127.0.0.1:9000", "log_level": "debug", "log_json": true}}"#)
            .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.relay.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.sessions.open_timeout_secs, 10);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/settings.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
