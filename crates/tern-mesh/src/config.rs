//! Engine configuration

use std::time::Duration;

use tern_config::MeshSettings;

/// Configuration for the reconciliation engine
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Target replica count per file
    pub replication_factor: usize,

    /// Heartbeat age after which a node is declared dead
    pub ping_timeout: Duration,

    /// How often to run the failure detector
    pub failure_check_interval: Duration,

    /// How often to aggregate node indexes
    pub refresh_interval: Duration,

    /// How often to run a validation pass
    pub validate_interval: Duration,

    /// Deadline for QUERY_INDEX
    pub query_timeout: Duration,

    /// Deadline for each add-replica RPC
    pub add_timeout: Duration,

    /// Deadline for each fix-procedure RPC
    pub repair_timeout: Duration,

    /// Deadline for each DELETE
    pub delete_timeout: Duration,

    /// Deadline for each ADD when storing a new file
    pub dispatch_timeout: Duration,

    /// Under-replicated files are left alone this long after a holder (re)joins
    pub warmup_window: Duration,

    /// Longest wait for an in-flight repair before a delete gives up
    pub delete_lock_wait: Duration,

    /// Poll period while waiting for a repair lock
    pub delete_lock_poll: Duration,

    /// Added to the current version when deleting
    pub tombstone_version_bump: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            ping_timeout: Duration::from_secs(20),
            failure_check_interval: Duration::from_millis(2_500),
            refresh_interval: Duration::from_secs(10),
            validate_interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(4),
            add_timeout: Duration::from_secs(8),
            repair_timeout: Duration::from_secs(4),
            delete_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(8),
            warmup_window: Duration::from_secs(15),
            delete_lock_wait: Duration::from_secs(2),
            delete_lock_poll: Duration::from_millis(50),
            tombstone_version_bump: 100,
        }
    }
}

impl From<&MeshSettings> for MeshConfig {
    fn from(settings: &MeshSettings) -> Self {
        Self {
            replication_factor: settings.replication_factor,
            ping_timeout: Duration::from_millis(settings.ping_timeout_ms),
            failure_check_interval: Duration::from_millis(settings.failure_check_interval_ms),
            refresh_interval: Duration::from_millis(settings.refresh_interval_ms),
            validate_interval: Duration::from_millis(settings.validate_interval_ms),
            query_timeout: Duration::from_millis(settings.query_timeout_ms),
            add_timeout: Duration::from_millis(settings.add_timeout_ms),
            repair_timeout: Duration::from_millis(settings.repair_timeout_ms),
            delete_timeout: Duration::from_millis(settings.delete_timeout_ms),
            dispatch_timeout: Duration::from_millis(settings.dispatch_timeout_ms),
            warmup_window: Duration::from_millis(settings.warmup_window_ms),
            delete_lock_wait: Duration::from_millis(settings.delete_lock_wait_ms),
            delete_lock_poll: Duration::from_millis(settings.delete_lock_poll_ms),
            tombstone_version_bump: settings.tombstone_version_bump,
        }
    }
}
