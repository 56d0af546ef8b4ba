//! Service configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::Duration;

use pumpsync_core::{SyncSettings, UploadRequest, UploadTarget};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Polling behavior.
    pub sync: SyncConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Bridge settings.
    pub device: DeviceConfig,
    /// Downstream uploads.
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    ///
    /// # Example
    ///
    /// ```
    /// use pumpsync_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.sync.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.device.validate());
        errors.extend(self.upload.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings handed to the sync orchestrator.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            poll_interval: Duration::milliseconds(self.sync.poll_interval_ms as i64),
            low_battery_poll_interval: Duration::milliseconds(
                self.sync.low_battery_poll_interval_ms as i64,
            ),
            reduce_poll_on_pump_away: self.sync.reduce_poll_on_pump_away,
            uploads: self.upload.requests(),
            ..Default::default()
        }
    }
}

/// Minimum poll interval in milliseconds (1 minute).
pub const MIN_POLL_INTERVAL_MS: u64 = 60_000;
/// Maximum poll interval in milliseconds (1 hour).
pub const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
/// Maximum upload delay in milliseconds.
pub const MAX_UPLOAD_DELAY_MS: u64 = 60_000;

/// Polling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Standard interval between polls.
    pub poll_interval_ms: u64,
    /// Interval while the pump battery is low.
    pub low_battery_poll_interval_ms: u64,
    /// Poll more often while the pump is out of reach.
    pub reduce_poll_on_pump_away: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300_000,
            low_battery_poll_interval_ms: 900_000,
            reduce_poll_on_pump_away: false,
        }
    }
}

impl SyncConfig {
    /// Validate polling configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("sync.poll_interval_ms", self.poll_interval_ms),
            (
                "sync.low_battery_poll_interval_ms",
                self.low_battery_poll_interval_ms,
            ),
        ] {
            if value < MIN_POLL_INTERVAL_MS {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!(
                        "interval {} is too short (minimum {} ms)",
                        value, MIN_POLL_INTERVAL_MS
                    ),
                });
            } else if value > MAX_POLL_INTERVAL_MS {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!(
                        "interval {} is too long (maximum {} ms / 1 hour)",
                        value, MAX_POLL_INTERVAL_MS
                    ),
                });
            }
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: pumpsync_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Recorded bridge session to replay instead of a USB bridge.
    pub replay: Option<PathBuf>,
}

impl DeviceConfig {
    /// Validate bridge configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(replay) = &self.replay
            && replay.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "device.replay".to_string(),
                message: "replay path cannot be empty (omit it instead)".to_string(),
            });
        }

        errors
    }
}

/// Downstream upload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub nightscout: bool,
    pub nightscout_delay_ms: u64,
    pub xdrip: bool,
    pub xdrip_delay_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            nightscout: true,
            nightscout_delay_ms: 1000,
            xdrip: false,
            xdrip_delay_ms: 500,
        }
    }
}

impl UploadConfig {
    /// Upload requests for the enabled targets.
    pub fn requests(&self) -> Vec<UploadRequest> {
        let mut requests = Vec::new();
        if self.nightscout {
            requests.push(UploadRequest {
                target: UploadTarget::Nightscout,
                delay: Duration::milliseconds(self.nightscout_delay_ms as i64),
            });
        }
        if self.xdrip {
            requests.push(UploadRequest {
                target: UploadTarget::Xdrip,
                delay: Duration::milliseconds(self.xdrip_delay_ms as i64),
            });
        }
        requests
    }

    /// Validate upload configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("upload.nightscout_delay_ms", self.nightscout_delay_ms),
            ("upload.xdrip_delay_ms", self.xdrip_delay_ms),
        ] {
            if value > MAX_UPLOAD_DELAY_MS {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!(
                        "delay {} is too long (maximum {} ms)",
                        value, MAX_UPLOAD_DELAY_MS
                    ),
                });
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `sync.poll_interval_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pumpsync")
        .join("service.toml")
}
