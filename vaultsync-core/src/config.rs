//! Settings file (`vaultsync.toml`).
//!
//! Every field has a default, so an empty or partial file is valid.

use crate::access::AnomalyConfig;
use crate::merge::MergeStrategy;
use crate::platform;
use crate::sync::{RetryPolicy, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySettings {
    pub threshold: usize,
    pub window_secs: u64,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        let config = AnomalyConfig::default();
        Self {
            threshold: config.threshold,
            window_secs: config.window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stable id of this device. Generated on first `init` when empty.
    pub device_id: String,
    pub device_name: String,
    pub vault_path: PathBuf,
    /// Folder shared through the file-sync provider.
    pub remote_dir: Option<PathBuf>,
    pub blob_id: String,
    pub strategy: MergeStrategy,
    pub retry: RetrySettings,
    pub max_restarts: u32,
    pub network_timeout_secs: u64,
    pub tombstone_retention_days: u64,
    pub anomaly: AnomalySettings,
}

impl Default for Settings {
    fn default() -> Self {
        let sync = SyncOptions::default();
        Self {
            device_id: String::new(),
            device_name: default_device_name(),
            vault_path: platform::get_default_vault_path(),
            remote_dir: None,
            blob_id: sync.blob_id,
            strategy: sync.strategy,
            retry: RetrySettings::default(),
            max_restarts: sync.max_restarts,
            network_timeout_secs: sync.network_timeout.as_secs(),
            tombstone_retention_days: 90,
            anomaly: AnomalySettings::default(),
        }
    }
}

impl Settings {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.blob_id.trim().is_empty() {
            return Err(invalid("blob_id", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.network_timeout_secs == 0 {
            return Err(invalid("network_timeout_secs", "must be at least 1"));
        }
        if self.anomaly.threshold == 0 {
            return Err(invalid("anomaly.threshold", "must be at least 1"));
        }
        if self.anomaly.window_secs == 0 {
            return Err(invalid("anomaly.window_secs", "must be at least 1"));
        }
        Ok(())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            blob_id: self.blob_id.clone(),
            strategy: self.strategy,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            max_restarts: self.max_restarts,
            network_timeout: Duration::from_secs(self.network_timeout_secs),
            ..SyncOptions::default()
        }
    }

    pub fn anomaly_config(&self) -> AnomalyConfig {
        AnomalyConfig {
            threshold: self.anomaly.threshold,
            window: Duration::from_secs(self.anomaly.window_secs),
        }
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_days * 24 * 60 * 60)
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "this device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join("vaultsync_test_config")
            .join(uuid::Uuid::new_v4().to_string())
            .join("vaultsync.toml")
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.strategy, MergeStrategy::FieldLevelMerge);
        assert_eq!(settings.anomaly.threshold, 10);
        assert_eq!(settings.anomaly.window_secs, 3600);
    }

    #[test]
    fn missing_file_loads_defaults() {
        assert_eq!(Settings::load(&temp_path()).unwrap(), Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            device_id = "laptop-1"
            strategy = "last-write-wins"

            [retry]
            max_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(settings.device_id, "laptop-1");
        assert_eq!(settings.strategy, MergeStrategy::LastWriteWins);
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.retry.base_delay_ms, RetrySettings::default().base_delay_ms);
        assert_eq!(settings.blob_id, "vault");
    }

    #[test]
    fn save_and_load() {
        let path = temp_path();
        let settings = Settings {
            device_id: "desk".to_string(),
            remote_dir: Some(PathBuf::from("/mnt/share/vault")),
            strategy: MergeStrategy::ManualPrompt,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn validate_rejects_zeroes() {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                ..
            })
        ));

        let mut settings = Settings::default();
        settings.network_timeout_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.anomaly.threshold = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn invalid_file_is_rejected() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "network_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Invalid { .. })
        ));

        std::fs::write(&path, "strategy = \"coin-flip\"\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn converts_to_runtime_options() {
        let settings = Settings {
            network_timeout_secs: 12,
            max_restarts: 1,
            ..Settings::default()
        };
        let options = settings.sync_options();
        assert_eq!(options.network_timeout, Duration::from_secs(12));
        assert_eq!(options.max_restarts, 1);
        assert_eq!(settings.tombstone_retention(), Duration::from_secs(90 * 86_400));
    }
}
