//! Node liveness registry and load-aware dispatch
//!
//! Every node ever seen stays in the registry. A node becomes alive only
//! when a heartbeat arrives and becomes dead only through
//! [`NodeRegistry::detect_failures`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tern_proto::{
    AddFile, DeleteFile, FileStatus, Heartbeat, NodeId, NodeRequest, ReplicaRecord, SharedChannel,
};
use tracing::{debug, info, warn};

use crate::clock::{elapsed, Clock};
use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::locks::RepairLocks;
use crate::metrics::RepairMetrics;
use crate::rpc::fan_out;

/// What a heartbeat meant for the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// First heartbeat ever from this node
    New,
    /// The node was dead and is back
    Reconnected,
    /// The node was already alive
    Refreshed,
}

/// Registry entry for one node
struct NodeState {
    /// Channel to the node
    channel: SharedChannel,

    /// First heartbeat ever
    first_seen: DateTime<Utc>,

    /// Start of the current liveness epoch
    last_start: DateTime<Utc>,

    /// Latest heartbeat
    last_ping: DateTime<Utc>,

    /// When the node was last declared dead
    last_dead: Option<DateTime<Utc>>,

    /// Liveness
    alive: bool,

    /// False after a reconnect until an operator investigates
    healthy: bool,

    /// Last reported load
    file_count: u64,
}

/// Public snapshot of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub alive: bool,
    pub healthy: bool,
    pub last_ping: DateTime<Utc>,
    pub first_start: DateTime<Utc>,
    pub last_start: DateTime<Utc>,
    pub last_dead: Option<DateTime<Utc>>,
    pub file_count: u64,
}

/// Tracks nodes, their liveness and their load
pub struct NodeRegistry {
    /// Configuration
    config: Arc<MeshConfig>,

    /// Time source
    clock: Arc<dyn Clock>,

    /// Nodes by id
    nodes: RwLock<BTreeMap<NodeId, NodeState>>,

    /// Repair locks shared with the engine
    locks: Arc<RepairLocks>,

    /// Metrics collector
    metrics: Arc<RepairMetrics>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new(
        config: Arc<MeshConfig>,
        clock: Arc<dyn Clock>,
        locks: Arc<RepairLocks>,
        metrics: Arc<RepairMetrics>,
    ) -> Self {
        Self {
            config,
            clock,
            nodes: RwLock::new(BTreeMap::new()),
            locks,
            metrics,
        }
    }

    /// Repair locks shared with the engine
    pub fn locks(&self) -> &Arc<RepairLocks> {
        &self.locks
    }

    /// Record a heartbeat and refresh the node's channel and load
    pub fn record_heartbeat(&self, report: &Heartbeat, channel: SharedChannel) -> HeartbeatOutcome {
        let now = self.clock.now();
        let mut nodes = self.nodes.write();

        let Some(state) = nodes.get_mut(&report.id) else {
            nodes.insert(
                report.id.clone(),
                NodeState {
                    channel,
                    first_seen: now,
                    last_start: now,
                    last_ping: now,
                    last_dead: None,
                    alive: true,
                    healthy: true,
                    file_count: report.file_count,
                },
            );
            info!(node_id = %report.id, file_count = report.file_count, "Node joined");
            return HeartbeatOutcome::New;
        };

        let outcome = if state.alive {
            HeartbeatOutcome::Refreshed
        } else {
            state.healthy = false;
            state.last_start = now;
            warn!(node_id = %report.id, "Node reconnected after being declared dead");
            HeartbeatOutcome::Reconnected
        };

        state.alive = true;
        state.last_ping = now;
        state.channel = channel;
        state.file_count = report.file_count;
        outcome
    }

    /// Declare alive nodes dead when their heartbeat is stale or their channel is closed.
    ///
    /// Returns the nodes that died in this call.
    pub fn detect_failures(&self) -> Vec<NodeId> {
        let now = self.clock.now();
        let mut died = Vec::new();

        for (id, state) in self.nodes.write().iter_mut() {
            if !state.alive {
                continue;
            }
            let age = elapsed(state.last_ping, now);
            let disconnected = !state.channel.is_connected();
            if age >= self.config.ping_timeout || disconnected {
                state.alive = false;
                state.last_dead = Some(now);
                warn!(node_id = %id, age_ms = age.as_millis() as u64, disconnected, "Node declared dead");
                died.push(id.clone());
            }
        }

        for _ in &died {
            self.metrics.record_node_dead();
        }
        died
    }

    /// Whether `node` is currently alive
    pub fn is_alive(&self, node: &str) -> bool {
        self.nodes.read().get(node).is_some_and(|s| s.alive)
    }

    /// Channel to `node` if it is alive
    pub fn live_channel(&self, node: &str) -> Option<SharedChannel> {
        self.nodes
            .read()
            .get(node)
            .filter(|s| s.alive)
            .map(|s| Arc::clone(&s.channel))
    }

    /// Every known node with its liveness, in id order
    pub fn known_nodes(&self) -> Vec<(NodeId, bool)> {
        self.nodes
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.alive))
            .collect()
    }

    /// Alive nodes with their channels, in id order
    pub fn alive_nodes(&self) -> Vec<(NodeId, SharedChannel)> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, s)| s.alive)
            .map(|(id, s)| (id.clone(), Arc::clone(&s.channel)))
            .collect()
    }

    /// Start of `node`'s current liveness epoch
    pub fn last_start(&self, node: &str) -> Option<DateTime<Utc>> {
        self.nodes.read().get(node).map(|s| s.last_start)
    }

    /// Last reported load of `node`
    pub fn file_count(&self, node: &str) -> Option<u64> {
        self.nodes.read().get(node).map(|s| s.file_count)
    }

    /// Snapshot of every node, in id order
    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .iter()
            .map(|(id, s)| NodeInfo {
                id: id.clone(),
                alive: s.alive,
                healthy: s.healthy,
                last_ping: s.last_ping,
                first_start: s.first_seen,
                last_start: s.last_start,
                last_dead: s.last_dead,
                file_count: s.file_count,
            })
            .collect()
    }

    /// Least-loaded alive node outside `exclusions`; ties go to the lowest id
    pub fn place_new_replica(
        &self,
        exclusions: &BTreeSet<NodeId>,
    ) -> Result<(NodeId, SharedChannel)> {
        self.nodes
            .read()
            .iter()
            .filter(|(id, s)| s.alive && !exclusions.contains(*id))
            .min_by_key(|(_, s)| s.file_count)
            .map(|(id, s)| (id.clone(), Arc::clone(&s.channel)))
            .ok_or_else(|| {
                Error::NoCapacity(format!(
                    "no alive node outside {} excluded node(s)",
                    exclusions.len()
                ))
            })
    }

    /// Most-loaded alive node among `candidates`; ties go to the lowest id
    pub fn most_loaded<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a NodeId>,
    ) -> Option<(NodeId, SharedChannel)> {
        let nodes = self.nodes.read();
        let mut best: Option<(&NodeId, &NodeState)> = None;
        for id in candidates {
            let Some(state) = nodes.get(id).filter(|s| s.alive) else {
                continue;
            };
            if best.map_or(true, |(_, b)| state.file_count > b.file_count) {
                best = Some((id, state));
            }
        }
        best.map(|(id, s)| (id.clone(), Arc::clone(&s.channel)))
    }

    /// Up to `count` alive nodes ordered by ascending load, ties by id
    pub fn select_least_loaded(&self, count: usize) -> Vec<(NodeId, SharedChannel)> {
        let nodes = self.nodes.read();
        let mut alive: Vec<_> = nodes.iter().filter(|(_, s)| s.alive).collect();
        alive.sort_by_key(|(_, s)| s.file_count);
        alive
            .into_iter()
            .take(count)
            .map(|(id, s)| (id.clone(), Arc::clone(&s.channel)))
            .collect()
    }

    /// Count a freshly placed replica against `node`'s load until its next heartbeat
    pub fn note_replica_added(&self, node: &str) {
        if let Some(state) = self.nodes.write().get_mut(node) {
            state.file_count += 1;
        }
    }

    /// Store a new file on up to R least-loaded alive nodes.
    ///
    /// Waits for every call to settle. Any failure makes the whole operation
    /// fail; writes already applied on other nodes are kept.
    pub async fn dispatch_add(&self, record: &ReplicaRecord, data: Bytes) -> Result<Vec<NodeId>> {
        let targets = self.select_least_loaded(self.config.replication_factor);
        if targets.is_empty() {
            return Err(Error::NoCapacity("no alive nodes".into()));
        }

        let status = (record.status != FileStatus::Pending).then_some(record.status);
        let calls = targets
            .into_iter()
            .map(|(node, channel)| {
                let request = NodeRequest::Add(AddFile {
                    id: record.id.clone(),
                    version: record.version,
                    data: data.clone(),
                    meta: record.meta.clone(),
                    status,
                });
                (node, channel, request)
            })
            .collect();

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (node, result) in fan_out(calls, self.config.dispatch_timeout).await {
            match result.and_then(|response| response.into_ack()) {
                Ok(()) => {
                    self.note_replica_added(&node);
                    succeeded.push(node);
                }
                Err(e) => {
                    warn!(file_id = %record.id, node_id = %node, error = %e, "ADD failed");
                    failed.push((node, e.to_string()));
                }
            }
        }

        if failed.is_empty() {
            debug!(file_id = %record.id, nodes = ?succeeded, "File dispatched");
            Ok(succeeded)
        } else {
            Err(Error::Partial {
                operation: "add",
                succeeded,
                failed,
            })
        }
    }

    /// Tombstone a file on every alive node of its replica set.
    ///
    /// Waits up to the configured lock wait for an in-flight repair to finish,
    /// holds the file's lock for the duration, and stamps the tombstone with
    /// `current_version` plus the configured bump.
    pub async fn dispatch_delete(
        &self,
        file_id: &str,
        current_version: u64,
        targets: &[NodeId],
    ) -> Result<Vec<(NodeId, Result<()>)>> {
        let _guard = self
            .locks
            .acquire_within(
                file_id,
                self.config.delete_lock_wait,
                self.config.delete_lock_poll,
            )
            .await
            .ok_or_else(|| Error::Busy(file_id.to_string()))?;

        let version = current_version + self.config.tombstone_version_bump;
        let calls = targets
            .iter()
            .filter_map(|node| {
                let channel = self.live_channel(node)?;
                let request = NodeRequest::Delete(DeleteFile {
                    id: file_id.to_string(),
                    version,
                    force: false,
                });
                Some((node.clone(), channel, request))
            })
            .collect();

        let results = fan_out(calls, self.config.delete_timeout)
            .await
            .into_iter()
            .map(|(node, result)| {
                let outcome = result
                    .and_then(|response| response.into_ack())
                    .map_err(|e| Error::rpc(node.clone(), e));
                (node, outcome)
            })
            .collect();

        info!(file_id, version, "Delete dispatched");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tern_proto::{NodeChannel, NodeResponse, RpcError};

    #[derive(Default)]
    struct StubChannel {
        closed: AtomicBool,
    }

    #[async_trait]
    impl NodeChannel for StubChannel {
        async fn call(&self, _request: NodeRequest) -> std::result::Result<NodeResponse, RpcError> {
            Ok(NodeResponse::Ack)
        }

        fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    fn registry() -> (NodeRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = NodeRegistry::new(
            Arc::new(MeshConfig::default()),
            clock.clone(),
            Arc::new(RepairLocks::new()),
            Arc::new(RepairMetrics::new()),
        );
        (registry, clock)
    }

    fn beat(registry: &NodeRegistry, id: &str, file_count: u64) -> HeartbeatOutcome {
        registry.record_heartbeat(
            &Heartbeat {
                id: id.into(),
                file_count,
            },
            Arc::new(StubChannel::default()),
        )
    }

    #[test]
    fn test_first_heartbeat_registers_node() {
        let (registry, _) = registry();
        assert_eq!(beat(&registry, "n1", 4), HeartbeatOutcome::New);
        assert_eq!(beat(&registry, "n1", 5), HeartbeatOutcome::Refreshed);

        let nodes = registry.list_nodes();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].alive);
        assert!(nodes[0].healthy);
        assert_eq!(nodes[0].file_count, 5);
    }

    #[test]
    fn test_stale_heartbeat_declares_dead() {
        let (registry, clock) = registry();
        beat(&registry, "n1", 0);
        beat(&registry, "n2", 0);

        clock.advance(Duration::from_secs(19));
        beat(&registry, "n2", 0);
        clock.advance(Duration::from_secs(1));

        assert_eq!(registry.detect_failures(), vec!["n1".to_string()]);
        assert!(!registry.is_alive("n1"));
        assert!(registry.is_alive("n2"));
        assert!(registry.list_nodes()[0].last_dead.is_some());
    }

    #[test]
    fn test_detect_failures_is_idempotent() {
        let (registry, clock) = registry();
        beat(&registry, "n1", 0);
        clock.advance(Duration::from_secs(30));

        assert_eq!(registry.detect_failures().len(), 1);
        assert!(registry.detect_failures().is_empty());
    }

    #[test]
    fn test_closed_channel_declares_dead() {
        let (registry, _) = registry();
        let channel = Arc::new(StubChannel::default());
        registry.record_heartbeat(
            &Heartbeat {
                id: "n1".into(),
                file_count: 0,
            },
            channel.clone(),
        );
        channel.closed.store(true, Ordering::SeqCst);

        assert_eq!(registry.detect_failures(), vec!["n1".to_string()]);
    }

    #[test]
    fn test_reconnect_marks_unhealthy_and_resets_epoch() {
        let (registry, clock) = registry();
        beat(&registry, "n1", 0);
        let first_start = registry.last_start("n1").unwrap();

        clock.advance(Duration::from_secs(25));
        registry.detect_failures();
        assert_eq!(beat(&registry, "n1", 0), HeartbeatOutcome::Reconnected);

        let info = &registry.list_nodes()[0];
        assert!(info.alive);
        assert!(!info.healthy);
        assert!(info.last_start > first_start);
        assert_eq!(info.first_start, first_start);

        // Healthy is not restored by later heartbeats
        beat(&registry, "n1", 0);
        assert!(!registry.list_nodes()[0].healthy);
    }

    #[test]
    fn test_place_new_replica_prefers_least_loaded() {
        let (registry, _) = registry();
        beat(&registry, "n1", 1);
        beat(&registry, "n2", 2);
        beat(&registry, "n3", 0);
        beat(&registry, "n4", 5);

        let (node, _) = registry.place_new_replica(&BTreeSet::new()).unwrap();
        assert_eq!(node, "n3");

        let exclusions: BTreeSet<NodeId> = ["n3".to_string()].into();
        let (node, _) = registry.place_new_replica(&exclusions).unwrap();
        assert_eq!(node, "n1");
    }

    #[test]
    fn test_place_new_replica_tie_goes_to_lowest_id() {
        let (registry, _) = registry();
        beat(&registry, "n2", 0);
        beat(&registry, "n1", 0);

        let (node, _) = registry.place_new_replica(&BTreeSet::new()).unwrap();
        assert_eq!(node, "n1");
    }

    #[test]
    fn test_place_new_replica_without_capacity() {
        let (registry, clock) = registry();
        beat(&registry, "n1", 0);
        let all: BTreeSet<NodeId> = ["n1".to_string()].into();
        assert!(matches!(
            registry.place_new_replica(&all),
            Err(Error::NoCapacity(_))
        ));

        clock.advance(Duration::from_secs(60));
        registry.detect_failures();
        assert!(matches!(
            registry.place_new_replica(&BTreeSet::new()),
            Err(Error::NoCapacity(_))
        ));
    }

    #[test]
    fn test_most_loaded_among_candidates() {
        let (registry, _) = registry();
        beat(&registry, "n1", 3);
        beat(&registry, "n2", 7);
        beat(&registry, "n3", 7);
        beat(&registry, "n4", 9);

        let candidates = ["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let (node, _) = registry.most_loaded(candidates.iter()).unwrap();
        assert_eq!(node, "n2");
    }

    #[test]
    fn test_select_least_loaded_orders_by_load() {
        let (registry, _) = registry();
        beat(&registry, "n1", 8);
        beat(&registry, "n2", 1);
        beat(&registry, "n3", 4);
        beat(&registry, "n4", 1);

        let picked: Vec<_> = registry
            .select_least_loaded(3)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(picked, vec!["n2", "n4", "n3"]);
    }

    #[tokio::test]
    async fn test_dispatch_add_counts_load() {
        let (registry, _) = registry();
        beat(&registry, "n1", 0);
        beat(&registry, "n2", 0);

        let record = ReplicaRecord::new("f1", 1, Default::default());
        let nodes = registry
            .dispatch_add(&record, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(nodes, vec!["n1", "n2"]);
        assert_eq!(registry.file_count("n1"), Some(1));
    }

    #[tokio::test]
    async fn test_dispatch_add_without_nodes() {
        let (registry, _) = registry();
        let record = ReplicaRecord::new("f1", 1, Default::default());
        let err = registry.dispatch_add(&record, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoCapacity(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_delete_busy_while_repair_in_flight() {
        let (registry, _) = registry();
        beat(&registry, "n1", 0);
        let _repair = registry.locks().try_acquire("f1").unwrap();

        let start = tokio::time::Instant::now();
        let err = registry
            .dispatch_delete("f1", 1, &["n1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dispatch_delete_releases_lock() {
        let (registry, _) = registry();
        beat(&registry, "n1", 0);

        let results = registry
            .dispatch_delete("f1", 1, &["n1".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert!(!registry.locks().is_locked("f1"));
    }
}
