//! Configuration structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConfigError, Result};

/// Prefix of recognised environment variables
pub const ENV_PREFIX: &str = "TERN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TernConfig {
    /// Master-side reconciliation settings
    pub mesh: MeshSettings,
    /// Storage node settings
    pub node: NodeSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Master-side reconciliation settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Target replica count per file
    pub replication_factor: usize,
    /// Heartbeat age after which a node is declared dead
    pub ping_timeout_ms: u64,
    /// Failure detector period
    pub failure_check_interval_ms: u64,
    /// Index aggregation period
    pub refresh_interval_ms: u64,
    /// Validation pass period
    pub validate_interval_ms: u64,
    /// QUERY_INDEX deadline
    pub query_timeout_ms: u64,
    /// Add-replica deadline
    pub add_timeout_ms: u64,
    /// Fix procedure deadline
    pub repair_timeout_ms: u64,
    /// DELETE deadline
    pub delete_timeout_ms: u64,
    /// Deadline for ADD fan-out on new files
    pub dispatch_timeout_ms: u64,
    /// Grace period for under-replicated files after a node (re)joins
    pub warmup_window_ms: u64,
    /// Longest wait for a repair lock before deleting
    pub delete_lock_wait_ms: u64,
    /// Poll period while waiting for a repair lock
    pub delete_lock_poll_ms: u64,
    /// Version increment applied to deleted files
    pub tombstone_version_bump: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            ping_timeout_ms: 20_000,
            failure_check_interval_ms: 2_500,
            refresh_interval_ms: 10_000,
            validate_interval_ms: 10_000,
            query_timeout_ms: 4_000,
            add_timeout_ms: 8_000,
            repair_timeout_ms: 4_000,
            delete_timeout_ms: 5_000,
            dispatch_timeout_ms: 8_000,
            warmup_window_ms: 15_000,
            delete_lock_wait_ms: 2_000,
            delete_lock_poll_ms: 50,
            tombstone_version_bump: 100,
        }
    }
}

/// Storage node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Integrity sweep period in milliseconds
    pub integrity_check_interval_ms: u64,
    /// Tombstone retention in seconds
    pub tombstone_retention_secs: u64,
    /// Directory for node data; in-memory when unset
    pub storage_root: Option<PathBuf>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            integrity_check_interval_ms: 25_000,
            tombstone_retention_secs: 48 * 60 * 60,
            storage_root: None,
        }
    }
}

impl NodeSettings {
    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Integrity sweep period
    pub fn integrity_check_interval(&self) -> Duration {
        Duration::from_millis(self.integrity_check_interval_ms)
    }

    /// Tombstone retention
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace | debug | info | warn | error
    pub level: String,
    /// pretty | compact | json
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl TernConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a file (or defaults), apply process environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TERN_*` overrides from `vars`. Unknown keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let mesh = &mut self.mesh;
            match name {
                "REPLICATION_FACTOR" => mesh.replication_factor = parse_env(&key, &value)?,
                "PING_TIMEOUT_MS" => mesh.ping_timeout_ms = parse_env(&key, &value)?,
                "FAILURE_CHECK_INTERVAL_MS" => {
                    mesh.failure_check_interval_ms = parse_env(&key, &value)?
                }
                "REFRESH_INTERVAL_MS" => mesh.refresh_interval_ms = parse_env(&key, &value)?,
                "VALIDATE_INTERVAL_MS" => mesh.validate_interval_ms = parse_env(&key, &value)?,
                "QUERY_TIMEOUT_MS" => mesh.query_timeout_ms = parse_env(&key, &value)?,
                "ADD_TIMEOUT_MS" => mesh.add_timeout_ms = parse_env(&key, &value)?,
                "REPAIR_TIMEOUT_MS" => mesh.repair_timeout_ms = parse_env(&key, &value)?,
                "DELETE_TIMEOUT_MS" => mesh.delete_timeout_ms = parse_env(&key, &value)?,
                "WARMUP_WINDOW_MS" => mesh.warmup_window_ms = parse_env(&key, &value)?,
                "HEARTBEAT_INTERVAL_MS" => {
                    self.node.heartbeat_interval_ms = parse_env(&key, &value)?
                }
                "STORAGE_ROOT" => self.node.storage_root = Some(PathBuf::from(value)),
                "LOG_LEVEL" => self.logging.level = value,
                "LOG_FORMAT" => self.logging.format = value,
                _ => continue,
            }
            debug!(key = %key, "Applied environment override");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::EnvVar(format!("{key}={value:?}: {e}")))
}
