//! Store migration configuration.
//!
//! Loaded once at startup from the environment or a YAML file and handed to
//! [`MigrationRouter::from_config`](crate::migration::MigrationRouter::from_config).
//! Nothing here is mutable after load; per-call overrides travel with the
//! call instead.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::migration::{MigrationError, MigrationPhase, SecondaryPolicy, SecondaryWriteMode};

pub const ENV_PHASE: &str = "TASK_STORE_PHASE";
pub const ENV_SECONDARY_TIMEOUT_MS: &str = "TASK_STORE_SECONDARY_TIMEOUT_MS";
pub const ENV_SECONDARY_WRITES: &str = "TASK_STORE_SECONDARY_WRITES";
pub const ENV_LEGACY_PATH: &str = "TASK_STORE_LEGACY_PATH";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_LIST_COMPARE: &str = "TASK_STORE_LIST_COMPARE";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A variable was set to something that does not parse.
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error(transparent)]
    Phase(#[from] MigrationError),
}

/// Settings for the task store migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreMigrationConfig {
    /// One of `legacy`, `dual_write`, `dual_read`, `target`.
    pub phase: String,
    /// Upper bound on every secondary (target) read or write.
    pub secondary_timeout_ms: Option<u64>,
    pub secondary_writes: SecondaryWriteMode,
    /// SQLite file backing the legacy document store.
    pub legacy_path: String,
    /// PostgreSQL URL of the target store.
    pub target_database_url: Option<String>,
    /// Compare list cardinality during `dual_read`.
    pub list_compare: bool,
}

impl Default for StoreMigrationConfig {
    fn default() -> Self {
        Self {
            phase: MigrationPhase::Legacy.as_str().to_string(),
            secondary_timeout_ms: None,
            secondary_writes: SecondaryWriteMode::Await,
            legacy_path: "data/task_store.db".to_string(),
            target_database_url: None,
            list_compare: true,
        }
    }
}

impl StoreMigrationConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(phase) = lookup(ENV_PHASE) {
            config.phase = phase;
        }
        if let Some(raw) = lookup(ENV_SECONDARY_TIMEOUT_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: ENV_SECONDARY_TIMEOUT_MS,
                value: raw.clone(),
            })?;
            config.secondary_timeout_ms = Some(ms);
        }
        if let Some(raw) = lookup(ENV_SECONDARY_WRITES) {
            config.secondary_writes = match raw.trim().to_ascii_lowercase().as_str() {
                "await" => SecondaryWriteMode::Await,
                "detached" => SecondaryWriteMode::Detached,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_SECONDARY_WRITES,
                        value: raw,
                    })
                }
            };
        }
        if let Some(path) = lookup(ENV_LEGACY_PATH) {
            config.legacy_path = path;
        }
        config.target_database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.is_empty());
        if let Some(raw) = lookup(ENV_LIST_COMPARE) {
            config.list_compare = parse_bool(&raw).ok_or(ConfigError::InvalidValue {
                key: ENV_LIST_COMPARE,
                value: raw.clone(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// The configured phase, validated.
    pub fn phase(&self) -> Result<MigrationPhase, MigrationError> {
        self.phase.parse()
    }

    pub fn secondary_timeout(&self) -> Option<Duration> {
        self.secondary_timeout_ms.map(Duration::from_millis)
    }

    pub fn secondary_policy(&self) -> SecondaryPolicy {
        SecondaryPolicy {
            timeout: self.secondary_timeout(),
            write_mode: self.secondary_writes,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.phase()?;
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
