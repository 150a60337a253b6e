//! Node background service: heartbeats and integrity sweeps

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tern_proto::Heartbeat;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::node::StorageNode;

/// Configuration for the node daemon
#[derive(Debug, Clone)]
pub struct NodeDaemonConfig {
    /// How often to report liveness to the master
    pub heartbeat_interval: Duration,

    /// How often to recompute checksums and purge tombstones
    pub integrity_interval: Duration,
}

impl Default for NodeDaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            integrity_interval: Duration::from_secs(25),
        }
    }
}

/// Background loops of one storage node
pub struct NodeDaemon {
    /// Configuration
    config: NodeDaemonConfig,

    /// The node
    node: Arc<StorageNode>,

    /// Running loop handles
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeDaemon {
    /// Create a daemon for `node`
    pub fn new(config: NodeDaemonConfig, node: Arc<StorageNode>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            node,
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Start the heartbeat and integrity loops; heartbeats go to `heartbeat_tx`
    pub fn start(&self, heartbeat_tx: mpsc::Sender<Heartbeat>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }

        info!(
            node_id = %self.node.id(),
            heartbeat_interval = ?self.config.heartbeat_interval,
            integrity_interval = ?self.config.integrity_interval,
            "Starting node daemon"
        );

        handles.push(self.spawn_heartbeat_loop(heartbeat_tx));
        handles.push(self.spawn_integrity_loop());
    }

    /// Stop all loops
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(node_id = %self.node.id(), "Node daemon stopped");
    }

    /// Whether the loops are running
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    fn spawn_heartbeat_loop(&self, heartbeat_tx: mpsc::Sender<Heartbeat>) -> JoinHandle<()> {
        let node = Arc::clone(&self.node);
        let period = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if heartbeat_tx.send(node.heartbeat()).await.is_err() {
                            debug!(node_id = %node.id(), "Master gone, heartbeat loop exiting");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(node_id = %node.id(), "Heartbeat loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_integrity_loop(&self) -> JoinHandle<()> {
        let node = Arc::clone(&self.node);
        let period = self.config.integrity_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match node.integrity_check().await {
                            Ok(report) if report.corrected > 0 || report.purged > 0 => {
                                info!(
                                    node_id = %node.id(),
                                    corrected = report.corrected,
                                    purged = report.purged,
                                    "Integrity sweep complete"
                                );
                            }
                            Ok(_) => debug!(node_id = %node.id(), "Integrity sweep clean"),
                            Err(e) => error!(node_id = %node.id(), error = %e, "Integrity sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(node_id = %node.id(), "Integrity loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}
