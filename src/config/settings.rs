//! Configuration settings for the audit broker.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BrokerError;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Storage barrier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the file barrier.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// File holding the 32-byte barrier key.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

/// Broker fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Upper bound on a single device write.
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
    /// How long a cached salt is trusted before re-reading the barrier.
    #[serde(default = "default_salt_cache_ttl")]
    pub salt_cache_ttl_seconds: u64,
}

/// Reconnect behaviour of network-socket devices.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/audit-broker")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/audit-broker/barrier.key")
}

fn default_device_timeout_ms() -> u64 {
    5_000
}

fn default_salt_cache_ttl() -> u64 {
    300
}

fn default_reconnect_base_ms() -> u64 {
    250
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            key_path: default_key_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: default_device_timeout_ms(),
            salt_cache_ttl_seconds: default_salt_cache_ttl(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn salt_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.salt_cache_ttl_seconds)
    }
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| BrokerError::Settings {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        Self::from_toml(&content).map_err(|e| BrokerError::Settings {
            message: format!("Failed to load config file '{}': {}", path.display(), e),
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, BrokerError> {
        let settings: Settings = toml::from_str(content).map_err(|e| BrokerError::Settings {
            message: e.to_string(),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    fn validate(&self) -> Result<(), BrokerError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(BrokerError::Settings {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(BrokerError::Settings {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        if self.broker.device_timeout_ms == 0 {
            return Err(BrokerError::Settings {
                message: "broker.device_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.socket.reconnect_base_ms > self.socket.reconnect_max_ms {
            return Err(BrokerError::Settings {
                message: format!(
                    "socket.reconnect_base_ms ({}) exceeds socket.reconnect_max_ms ({})",
                    self.socket.reconnect_base_ms, self.socket.reconnect_max_ms
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_log_format(), "pretty");
        assert_eq!(default_device_timeout_ms(), 5_000);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.broker.device_timeout(), Duration::from_secs(5));
        assert_eq!(settings.socket.reconnect_max_ms, 30_000);
    }

    #[test]
    fn test_sections_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [storage]
            path = "/tmp/barrier"

            [broker]
            device_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(settings.logging.format, "json");
        assert_eq!(settings.storage.path, PathBuf::from("/tmp/barrier"));
        assert_eq!(settings.broker.device_timeout_ms, 250);
        assert_eq!(settings.broker.salt_cache_ttl_seconds, 300);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = Settings::from_toml("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, BrokerError::Settings { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(Settings::from_toml("[broker]\ndevice_timeout_ms = 0\n").is_err());
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let err = Settings::from_toml(
            "[socket]\nreconnect_base_ms = 5000\nreconnect_max_ms = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("reconnect_base_ms"));
    }
}
