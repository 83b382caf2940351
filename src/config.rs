//! Service configuration loaded from TOML.
//!
//! Provides two loading methods:
//! - `default_config()` - the defaults embedded in the binary
//! - `load_config(path)` - a file on disk; missing keys fall back to defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default configuration embedded at compile time from `config/spoolsync.toml`.
const DEFAULT_CONFIG: &str = include_str!("../config/spoolsync.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// SQLite file. When unset, `<data_dir>/spoolsync/spoolsync.db` is used.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub bambu: BambuSettings,
    #[serde(default)]
    pub klipper: KlipperSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Worker lanes persisting inbound messages. A printer's messages
    /// always go through the same lane, in order.
    pub workers: usize,
    /// Capacity of the driver -> dispatcher event channel.
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Minimum time between two compensating commands for the same slot.
    pub conflict_cooldown_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            conflict_cooldown_secs: 60,
        }
    }
}

impl ManagerSettings {
    pub fn conflict_cooldown(&self) -> Duration {
        Duration::from_secs(self.conflict_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BambuSettings {
    pub reconnect_delay_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for BambuSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 10,
            stop_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KlipperSettings {
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for KlipperSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            request_timeout_secs: 10,
        }
    }
}

/// Timing knobs handed to every driver at construction.
#[derive(Debug, Clone, Default)]
pub struct DriverSettings {
    pub bambu: BambuSettings,
    pub klipper: KlipperSettings,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl ServiceConfig {
    /// Resolve the database location, falling back to the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spoolsync")
            .join("spoolsync.db")
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            bambu: self.bambu.clone(),
            klipper: self.klipper.clone(),
        }
    }
}

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: ServiceConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    Ok(config)
}

/// Get the default configuration embedded in the binary.
///
/// # Panics
/// Panics if the embedded TOML is invalid (this would be a compile-time bug).
pub fn default_config() -> ServiceConfig {
    toml::from_str(DEFAULT_CONFIG).expect("embedded spoolsync.toml must be valid TOML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_loads() {
        let config = default_config();
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.manager.conflict_cooldown_secs, 60);
        assert_eq!(config.bambu.reconnect_delay_secs, 10);
        assert_eq!(config.klipper.poll_interval_secs, 10);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "database_path = \"/tmp/spools.db\"\n[klipper]\npoll_interval_secs = 30\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/spools.db"));
        assert_eq!(config.klipper.poll_interval_secs, 30);
        assert_eq!(config.klipper.request_timeout_secs, 10);
        assert_eq!(config.dispatch.queue_capacity, 256);
        assert_eq!(config.log_format, "text");
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = load_config(Path::new("/nonexistent/spoolsync.toml"));
        assert!(result.is_err());
    }
}
