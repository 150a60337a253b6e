//! Master coordinator: scheduling loops and the file API
//!
//! Wires heartbeats into the registry and drives three periodic loops:
//!
//! ```text
//!   failure check (2.5s) ──▶ NodeRegistry::detect_failures
//!   refresh       (10s)  ──▶ ReplicationEngine::refresh_all
//!   validate      (10s)  ──▶ ReplicationEngine::validate
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tern_proto::{FileStatus, Heartbeat, NodeId, ReplicaRecord, SharedChannel};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::MeshConfig;
use crate::engine::{FileListing, ReplicationEngine};
use crate::error::{Error, Result};
use crate::locks::RepairLocks;
use crate::metrics::{RepairMetrics, RepairStats};
use crate::registry::{HeartbeatOutcome, NodeInfo, NodeRegistry};

/// State of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Loops are not running
    Stopped,
    /// Loops are being spawned
    Starting,
    /// Loops are running
    Running,
    /// Loops are being stopped
    ShuttingDown,
}

/// The master side of the mesh
pub struct Coordinator {
    /// Configuration
    config: Arc<MeshConfig>,

    /// Node registry
    registry: Arc<NodeRegistry>,

    /// Replication engine
    engine: Arc<ReplicationEngine>,

    /// Metrics collector
    metrics: Arc<RepairMetrics>,

    /// Current state
    state: RwLock<CoordinatorState>,

    /// Running loop handles
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl Coordinator {
    /// Create a coordinator on the system clock
    pub fn new(config: MeshConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a coordinator on a custom clock
    pub fn with_clock(config: MeshConfig, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(RepairMetrics::new());
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::new(RepairLocks::new()),
            Arc::clone(&metrics),
        ));
        let engine = Arc::new(ReplicationEngine::new(
            Arc::clone(&config),
            clock,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            engine,
            metrics,
            state: RwLock::new(CoordinatorState::Stopped),
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Start the failure, refresh and validate loops
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != CoordinatorState::Stopped {
            return Ok(());
        }
        *state = CoordinatorState::Starting;
        drop(state);

        info!(
            replication_factor = self.config.replication_factor,
            failure_check_interval = ?self.config.failure_check_interval,
            refresh_interval = ?self.config.refresh_interval,
            validate_interval = ?self.config.validate_interval,
            "Starting coordinator"
        );

        {
            let mut handles = self.handles.lock();
            handles.push(self.spawn_failure_loop());
            handles.push(self.spawn_refresh_loop());
            handles.push(self.spawn_validate_loop());
        }

        *self.state.write().await = CoordinatorState::Running;
        self.metrics.record_start();
        info!("Coordinator started");
        Ok(())
    }

    /// Stop all loops and wait for them to exit
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == CoordinatorState::Stopped {
            return Ok(());
        }
        *state = CoordinatorState::ShuttingDown;
        drop(state);

        info!("Stopping coordinator");
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Coordinator loop ended abnormally");
            }
        }

        *self.state.write().await = CoordinatorState::Stopped;
        self.metrics.record_stop();
        info!("Coordinator stopped");
        Ok(())
    }

    /// Get current state
    pub async fn state(&self) -> CoordinatorState {
        *self.state.read().await
    }

    /// Record a heartbeat; a new or returning node gets its index pulled
    pub fn handle_heartbeat(&self, report: &Heartbeat, channel: SharedChannel) -> HeartbeatOutcome {
        let outcome = self.registry.record_heartbeat(report, channel);
        if outcome != HeartbeatOutcome::Refreshed {
            let engine = Arc::clone(&self.engine);
            let node = report.id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.refresh_node(&node).await {
                    warn!(node_id = %node, error = %e, "Initial index pull failed");
                }
            });
        }
        outcome
    }

    /// Live files
    pub fn list_files(&self) -> Vec<FileListing> {
        self.engine.list_files()
    }

    /// Every known node
    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.registry.list_nodes()
    }

    /// Store a new file on up to R nodes and return how many hold it.
    ///
    /// `size` must match the content length. Partial failures are not
    /// rolled back; validation heals them.
    pub async fn add_file(&self, content: Bytes, name: &str, size: u64) -> Result<usize> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("file name must not be empty".into()));
        }
        if content.is_empty() || size == 0 {
            return Err(Error::InvalidInput("file content must not be empty".into()));
        }
        if size != content.len() as u64 {
            return Err(Error::InvalidInput(format!(
                "declared size {size} does not match content length {}",
                content.len()
            )));
        }

        let mut meta = BTreeMap::new();
        meta.insert("name".to_string(), Value::from(name));
        meta.insert("size".to_string(), Value::from(size));

        let mut record = ReplicaRecord::new(Uuid::new_v4().to_string(), 1, meta);
        record.status = FileStatus::Live;
        record.refresh_checksums(&content);

        let result = self.registry.dispatch_add(&record, content).await;
        self.engine.refresh_all().await;

        let nodes = result?;
        info!(file_id = %record.id, name, size, replicas = nodes.len(), "File added");
        Ok(nodes.len())
    }

    /// Tombstone a file everywhere it lives and return how many nodes acknowledged
    pub async fn delete_file(&self, file_id: &str) -> Result<usize> {
        let entry = self
            .engine
            .entry(file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        let targets: Vec<NodeId> = entry
            .replicas
            .keys()
            .filter(|node| self.registry.is_alive(node))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(Error::FileNotFound(file_id.to_string()));
        }

        let results = self
            .registry
            .dispatch_delete(file_id, entry.current_version(), &targets)
            .await;
        self.engine.refresh_all().await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (node, outcome) in results? {
            match outcome {
                Ok(()) => succeeded.push(node),
                Err(e) => failed.push((node, e.to_string())),
            }
        }

        if !failed.is_empty() {
            return Err(Error::Partial {
                operation: "delete",
                succeeded,
                failed,
            });
        }
        info!(file_id, replicas = succeeded.len(), "File deleted");
        Ok(succeeded.len())
    }

    /// Node registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Replication engine
    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    /// Metrics snapshot
    pub fn stats(&self) -> RepairStats {
        self.metrics.stats()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<RepairMetrics> {
        &self.metrics
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    fn spawn_failure_loop(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = self.config.failure_check_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dead = registry.detect_failures();
                        if !dead.is_empty() {
                            debug!(nodes = ?dead, "Failure check marked nodes dead");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Failure loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = Self::ticker(self.config.refresh_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.refresh_all().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Refresh loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_validate_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = Self::ticker(self.config.validate_interval);

        tokio::spawn(async move {
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = engine.validate().await;
                        debug!(
                            examined = report.examined,
                            attempted = report.attempted,
                            failed = report.failed,
                            "Validation pass complete"
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Validate loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    fn ticker(period: Duration) -> tokio::time::Interval {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}
