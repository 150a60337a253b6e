//! Per-file repair locks
//!
//! At most one repair or delete may be in flight per file id. The lock
//! table lives outside the mesh so it survives mesh rebuilds; a
//! [`RepairGuard`] releases its lock when dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tern_proto::FileId;
use tokio::time::Instant;
use tracing::trace;

/// Process-local advisory locks keyed by file id
#[derive(Debug, Default)]
pub struct RepairLocks {
    held: DashSet<FileId>,
}

impl RepairLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `file_id` if it is free
    pub fn try_acquire(self: &Arc<Self>, file_id: &str) -> Option<RepairGuard> {
        if self.held.insert(file_id.to_string()) {
            trace!(file_id, "Repair lock acquired");
            Some(RepairGuard {
                locks: Arc::clone(self),
                file_id: file_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Poll for the lock every `poll` until `wait` has passed
    pub async fn acquire_within(
        self: &Arc<Self>,
        file_id: &str,
        wait: Duration,
        poll: Duration,
    ) -> Option<RepairGuard> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(file_id) {
                return Some(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Whether a repair currently holds `file_id`
    pub fn is_locked(&self, file_id: &str) -> bool {
        self.held.contains(file_id)
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether no locks are held
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Holds one file's repair lock until dropped
#[derive(Debug)]
pub struct RepairGuard {
    locks: Arc<RepairLocks>,
    file_id: FileId,
}

impl RepairGuard {
    /// The locked file
    pub fn file_id(&self) -> &str {
        &self.file_id
    }
}

impl Drop for RepairGuard {
    fn drop(&mut self) {
        self.locks.held.remove(&self.file_id);
        trace!(file_id = %self.file_id, "Repair lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let locks = Arc::new(RepairLocks::new());
        let guard = locks.try_acquire("f1").unwrap();
        assert!(locks.is_locked("f1"));
        assert!(locks.try_acquire("f1").is_none());
        assert!(locks.try_acquire("f2").is_some());

        drop(guard);
        assert!(!locks.is_locked("f1"));
        assert!(locks.try_acquire("f1").is_some());
    }

    #[test]
    fn test_guard_released_on_drop() {
        let locks = Arc::new(RepairLocks::new());
        {
            let guard = locks.try_acquire("f1").unwrap();
            assert_eq!(guard.file_id(), "f1");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_gives_up() {
        let locks = Arc::new(RepairLocks::new());
        let _held = locks.try_acquire("f1").unwrap();

        let start = Instant::now();
        let guard = locks
            .acquire_within("f1", Duration::from_secs(2), Duration::from_millis(50))
            .await;
        assert!(guard.is_none());
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_waits_for_release() {
        let locks = Arc::new(RepairLocks::new());
        let held = locks.try_acquire("f1").unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        });

        let guard = locks
            .acquire_within("f1", Duration::from_secs(2), Duration::from_millis(50))
            .await;
        assert!(guard.is_some());
    }
}
