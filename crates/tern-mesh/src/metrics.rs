//! Reconciliation metrics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::quorum::MismatchKind;

/// Engine and coordinator metrics
pub struct RepairMetrics {
    /// Time when the coordinator started
    start_time: RwLock<Option<Instant>>,

    /// Validation passes run
    validations_total: AtomicU64,

    /// Total time spent validating (microseconds)
    validation_time_us: AtomicU64,

    /// Add-replica attempts
    adds_attempted: AtomicU64,

    /// Remove-excess attempts
    removals_attempted: AtomicU64,

    /// Fix attempts by mismatch category
    version_fixes_attempted: AtomicU64,
    meta_fixes_attempted: AtomicU64,
    content_fixes_attempted: AtomicU64,

    /// Repairs that returned an error
    repairs_failed: AtomicU64,

    /// Aggregation rounds
    refreshes_total: AtomicU64,

    /// Nodes that failed to answer QUERY_INDEX
    query_failures: AtomicU64,

    /// Nodes declared dead by the failure detector
    nodes_declared_dead: AtomicU64,
}

impl RepairMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            validations_total: AtomicU64::new(0),
            validation_time_us: AtomicU64::new(0),
            adds_attempted: AtomicU64::new(0),
            removals_attempted: AtomicU64::new(0),
            version_fixes_attempted: AtomicU64::new(0),
            meta_fixes_attempted: AtomicU64::new(0),
            content_fixes_attempted: AtomicU64::new(0),
            repairs_failed: AtomicU64::new(0),
            refreshes_total: AtomicU64::new(0),
            query_failures: AtomicU64::new(0),
            nodes_declared_dead: AtomicU64::new(0),
        }
    }

    /// Record coordinator start
    pub fn record_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Record coordinator stop
    pub fn record_stop(&self) {
        *self.start_time.write() = None;
    }

    /// Record a finished validation pass
    pub fn record_validation(&self, duration: Duration) {
        self.validations_total.fetch_add(1, Ordering::Relaxed);
        self.validation_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record an add-replica attempt
    pub fn record_add_attempt(&self) {
        self.adds_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a remove-excess attempt
    pub fn record_removal_attempt(&self) {
        self.removals_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fix attempt
    pub fn record_fix_attempt(&self, kind: MismatchKind) {
        let counter = match kind {
            MismatchKind::Version => &self.version_fixes_attempted,
            MismatchKind::MetaCrc => &self.meta_fixes_attempted,
            MismatchKind::FileCrc => &self.content_fixes_attempted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed repair
    pub fn record_repair_failure(&self) {
        self.repairs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an aggregation round
    pub fn record_refresh(&self) {
        self.refreshes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a node that did not answer QUERY_INDEX
    pub fn record_query_failure(&self) {
        self.query_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a node declared dead
    pub fn record_node_dead(&self) {
        self.nodes_declared_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.read().as_ref().map(|t: &Instant| t.elapsed())
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> RepairStats {
        RepairStats {
            uptime_secs: self.uptime().map(|d| d.as_secs()).unwrap_or(0),
            validations_total: self.validations_total.load(Ordering::Relaxed),
            avg_validation_time_ms: self.avg_validation_time_ms(),
            adds_attempted: self.adds_attempted.load(Ordering::Relaxed),
            removals_attempted: self.removals_attempted.load(Ordering::Relaxed),
            version_fixes_attempted: self.version_fixes_attempted.load(Ordering::Relaxed),
            meta_fixes_attempted: self.meta_fixes_attempted.load(Ordering::Relaxed),
            content_fixes_attempted: self.content_fixes_attempted.load(Ordering::Relaxed),
            repairs_failed: self.repairs_failed.load(Ordering::Relaxed),
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            nodes_declared_dead: self.nodes_declared_dead.load(Ordering::Relaxed),
        }
    }

    fn avg_validation_time_ms(&self) -> f64 {
        let passes = self.validations_total.load(Ordering::Relaxed);
        if passes == 0 {
            return 0.0;
        }
        let total_us = self.validation_time_us.load(Ordering::Relaxed);
        (total_us as f64 / passes as f64) / 1000.0
    }
}

impl Default for RepairMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairStats {
    pub uptime_secs: u64,
    pub validations_total: u64,
    pub avg_validation_time_ms: f64,
    pub adds_attempted: u64,
    pub removals_attempted: u64,
    pub version_fixes_attempted: u64,
    pub meta_fixes_attempted: u64,
    pub content_fixes_attempted: u64,
    pub repairs_failed: u64,
    pub refreshes_total: u64,
    pub query_failures: u64,
    pub nodes_declared_dead: u64,
}

impl RepairStats {
    /// All repair attempts of any kind
    pub fn repairs_attempted(&self) -> u64 {
        self.adds_attempted
            + self.removals_attempted
            + self.version_fixes_attempted
            + self.meta_fixes_attempted
            + self.content_fixes_attempted
    }

    /// Fraction of repair attempts that did not error
    pub fn repair_success_rate(&self) -> f64 {
        let total = self.repairs_attempted();
        if total == 0 {
            return 1.0;
        }
        (total.saturating_sub(self.repairs_failed)) as f64 / total as f64
    }
}
