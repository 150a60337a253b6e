//! Configuration validation

use crate::config::{MeshSettings, TernConfig};
use crate::{ConfigError, Result};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "warning", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

impl TernConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        validate_mesh(&self.mesh)?;

        if self.node.heartbeat_interval_ms == 0 {
            return Err(invalid("node.heartbeat_interval_ms", "must be non-zero"));
        }
        if self.node.integrity_check_interval_ms == 0 {
            return Err(invalid(
                "node.integrity_check_interval_ms",
                "must be non-zero",
            ));
        }
        if self.node.heartbeat_interval_ms >= self.mesh.ping_timeout_ms {
            return Err(ConfigError::Validation(format!(
                "heartbeat interval ({}ms) must be shorter than the ping timeout ({}ms)",
                self.node.heartbeat_interval_ms, self.mesh.ping_timeout_ms
            )));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid("logging.level", &format!("unknown level {level:?}")));
        }
        let format = self.logging.format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(invalid(
                "logging.format",
                &format!("unknown format {format:?}"),
            ));
        }
        Ok(())
    }
}

/// Validate master-side settings
pub fn validate_mesh(mesh: &MeshSettings) -> Result<()> {
    if mesh.replication_factor == 0 {
        return Err(invalid("mesh.replication_factor", "must be at least 1"));
    }

    let non_zero = [
        ("mesh.ping_timeout_ms", mesh.ping_timeout_ms),
        ("mesh.failure_check_interval_ms", mesh.failure_check_interval_ms),
        ("mesh.refresh_interval_ms", mesh.refresh_interval_ms),
        ("mesh.validate_interval_ms", mesh.validate_interval_ms),
        ("mesh.query_timeout_ms", mesh.query_timeout_ms),
        ("mesh.add_timeout_ms", mesh.add_timeout_ms),
        ("mesh.repair_timeout_ms", mesh.repair_timeout_ms),
        ("mesh.delete_timeout_ms", mesh.delete_timeout_ms),
        ("mesh.dispatch_timeout_ms", mesh.dispatch_timeout_ms),
        ("mesh.delete_lock_poll_ms", mesh.delete_lock_poll_ms),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            return Err(invalid(field, "must be non-zero"));
        }
    }

    if mesh.ping_timeout_ms <= mesh.failure_check_interval_ms {
        return Err(ConfigError::Validation(format!(
            "ping timeout ({}ms) must exceed the failure check interval ({}ms)",
            mesh.ping_timeout_ms, mesh.failure_check_interval_ms
        )));
    }
    if mesh.delete_lock_poll_ms > mesh.delete_lock_wait_ms {
        return Err(ConfigError::Validation(format!(
            "delete lock poll ({}ms) must not exceed the delete lock wait ({}ms)",
            mesh.delete_lock_poll_ms, mesh.delete_lock_wait_ms
        )));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
