//! Replication engine: mesh aggregation and validation
//!
//! Pulls every node's file index, merges the snapshots into a [`Mesh`] and
//! runs validation passes that repair one replica per file per pass.

mod repair;

pub use repair::RepairOutcome;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tern_proto::{
    call_with_timeout, FileId, FileIndex, NodeId, NodeRequest, ReplicaRecord, RpcError,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::{elapsed, Clock};
use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::locks::RepairLocks;
use crate::mesh::{Mesh, MeshEntry};
use crate::metrics::RepairMetrics;
use crate::quorum::{self, MismatchKind};
use crate::registry::NodeRegistry;
use crate::rpc;

use repair::RepairAction;

/// A live file as shown to API clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileListing {
    /// File id
    pub id: FileId,
    /// Nodes holding a record for the file
    pub node_ids: Vec<NodeId>,
    /// Display name
    pub name: Option<String>,
    /// Representative record
    pub info: ReplicaRecord,
}

/// Outcome of one aggregation round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Nodes asked for their index
    pub queried: usize,
    /// Queried nodes that failed or timed out
    pub failed: usize,
    /// Known nodes skipped because they are dead
    pub dead: usize,
    /// Nodes the failure detector declared dead in this round
    pub newly_dead: Vec<NodeId>,
}

/// Outcome of one validation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Files examined
    pub examined: usize,
    /// Files skipped because a repair already held the lock
    pub skipped_locked: usize,
    /// Under-replicated files left alone during warm-up
    pub skipped_warmup: usize,
    /// Repairs attempted
    pub attempted: usize,
    /// Repairs that returned an error
    pub failed: usize,
    /// Successful repair outcomes by file
    pub outcomes: Vec<(FileId, RepairOutcome)>,
    /// Aggregation round run after repairs, if any
    pub refresh: Option<RefreshReport>,
}

/// Aggregates node indexes and repairs drift
pub struct ReplicationEngine {
    /// Configuration
    config: Arc<MeshConfig>,

    /// Time source
    clock: Arc<dyn Clock>,

    /// Node registry
    registry: Arc<NodeRegistry>,

    /// Raw index per node; empty for dead or unreachable nodes
    snapshots: RwLock<BTreeMap<NodeId, FileIndex>>,

    /// Current projection, replaced whole on every rebuild
    mesh: RwLock<Arc<Mesh>>,

    /// Per-file repair locks, shared with the registry
    locks: Arc<RepairLocks>,

    /// Metrics collector
    metrics: Arc<RepairMetrics>,
}

impl ReplicationEngine {
    /// Create an engine over `registry`
    pub fn new(
        config: Arc<MeshConfig>,
        clock: Arc<dyn Clock>,
        registry: Arc<NodeRegistry>,
        metrics: Arc<RepairMetrics>,
    ) -> Self {
        let locks = Arc::clone(registry.locks());
        Self {
            config,
            clock,
            registry,
            snapshots: RwLock::new(BTreeMap::new()),
            mesh: RwLock::new(Arc::new(Mesh::default())),
            locks,
            metrics,
        }
    }

    /// Node registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Store one node's index and rebuild the mesh
    pub fn ingest_node_snapshot(&self, node: &str, index: FileIndex) {
        debug!(node_id = node, files = index.len(), "Ingesting node snapshot");
        self.snapshots.write().insert(node.to_string(), index);
        self.rebuild_mesh();
    }

    /// Rebuild the mesh from all stored snapshots and swap it in
    pub fn rebuild_mesh(&self) -> Arc<Mesh> {
        // Readers of snapshots cannot interleave with a swap, so the
        // installed mesh always reflects the latest ingested snapshot.
        let snapshots = self.snapshots.read();
        let mesh = Arc::new(Mesh::build(&snapshots));
        *self.mesh.write() = Arc::clone(&mesh);
        mesh
    }

    /// Current mesh
    pub fn mesh(&self) -> Arc<Mesh> {
        Arc::clone(&self.mesh.read())
    }

    /// One file's entry, with its lock state
    pub fn entry(&self, file_id: &str) -> Option<MeshEntry> {
        let mut entry = self.mesh().get(file_id)?.clone();
        entry.locked = self.locks.is_locked(file_id);
        Some(entry)
    }

    /// Live files, judged by each file's first replica in node order
    pub fn list_files(&self) -> Vec<FileListing> {
        self.mesh()
            .entries()
            .filter_map(|entry| {
                let (_, info) = entry.representative()?;
                if !info.is_live() {
                    return None;
                }
                Some(FileListing {
                    id: entry.id.clone(),
                    node_ids: entry.node_ids(),
                    name: info.display_name().map(str::to_string),
                    info: info.clone(),
                })
            })
            .collect()
    }

    /// First disagreement among a file's replicas, if any
    pub fn detect_mismatch(&self, file_id: &str) -> Option<MismatchKind> {
        quorum::detect_mismatch(&self.mesh().get(file_id)?.replicas)
    }

    /// Query one alive node's index and ingest it
    pub async fn refresh_node(&self, node: &str) -> Result<usize> {
        let channel = self
            .registry
            .live_channel(node)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;

        let result = rpc::call(
            node,
            &channel,
            NodeRequest::QueryIndex,
            self.config.query_timeout,
        )
        .await
        .and_then(|response| response.into_index().map_err(|e| Error::rpc(node, e)));

        match result {
            Ok(index) => {
                let files = index.len();
                self.ingest_node_snapshot(node, index);
                Ok(files)
            }
            Err(e) => {
                self.metrics.record_query_failure();
                self.ingest_node_snapshot(node, FileIndex::new());
                Err(e)
            }
        }
    }

    /// Detect failures, then pull every alive node's index.
    ///
    /// Dead nodes and nodes that fail or time out contribute an empty index.
    /// Each answer is ingested as it arrives.
    pub async fn refresh_all(&self) -> RefreshReport {
        let mut report = RefreshReport {
            newly_dead: self.registry.detect_failures(),
            ..Default::default()
        };

        let timeout = self.config.query_timeout;
        let mut queries = JoinSet::new();
        for (node, alive) in self.registry.known_nodes() {
            let channel = if alive {
                self.registry.live_channel(&node)
            } else {
                None
            };
            let Some(channel) = channel else {
                report.dead += 1;
                self.snapshots.write().insert(node, FileIndex::new());
                continue;
            };

            report.queried += 1;
            queries.spawn(async move {
                let result = call_with_timeout(channel.as_ref(), NodeRequest::QueryIndex, timeout)
                    .await
                    .and_then(|response| response.into_index());
                (node, result)
            });
        }
        self.rebuild_mesh();

        while let Some(joined) = queries.join_next().await {
            let (node, result): (NodeId, std::result::Result<FileIndex, RpcError>) = match joined {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(error = %e, "Index query task aborted");
                    report.failed += 1;
                    continue;
                }
            };
            let index = result.unwrap_or_else(|e| {
                warn!(node_id = %node, error = %e, "Index query failed, treating node as empty");
                self.metrics.record_query_failure();
                report.failed += 1;
                FileIndex::new()
            });
            self.ingest_node_snapshot(&node, index);
        }

        self.metrics.record_refresh();
        debug!(
            queried = report.queried,
            failed = report.failed,
            dead = report.dead,
            files = self.mesh().len(),
            "Refresh complete"
        );
        report
    }

    /// Run one validation pass over every file.
    ///
    /// Files are handled one at a time under their repair lock. At most one
    /// repair runs per file; when any repair was attempted the pass ends with
    /// a full refresh.
    pub async fn validate(&self) -> ValidationReport {
        let started = Instant::now();
        let mesh = self.mesh();
        let now = self.clock.now();
        let target = self.config.replication_factor;
        let mut report = ValidationReport::default();

        for entry in mesh.entries() {
            report.examined += 1;

            let Some(_guard) = self.locks.try_acquire(&entry.id) else {
                debug!(file_id = %entry.id, "Repair in flight, skipping");
                report.skipped_locked += 1;
                continue;
            };

            let count = entry.replica_count();
            if count < target && self.in_warmup(entry, now) {
                debug!(file_id = %entry.id, replicas = count, "Within warm-up window, skipping");
                report.skipped_warmup += 1;
                continue;
            }

            let action = match count.cmp(&target) {
                Ordering::Greater => RepairAction::RemoveExcess,
                Ordering::Less => RepairAction::AddReplica,
                Ordering::Equal => match quorum::detect_mismatch(&entry.replicas) {
                    Some(kind) => RepairAction::Fix(kind),
                    None => continue,
                },
            };

            report.attempted += 1;
            action.record_attempt(&self.metrics);
            match self.run_repair(action, entry).await {
                Ok(outcome) => report.outcomes.push((entry.id.clone(), outcome)),
                Err(e) => {
                    warn!(file_id = %entry.id, action = %action, error = %e, "Repair failed");
                    self.metrics.record_repair_failure();
                    report.failed += 1;
                }
            }
        }

        self.metrics.record_validation(started.elapsed());
        if report.attempted > 0 {
            info!(
                examined = report.examined,
                attempted = report.attempted,
                failed = report.failed,
                "Validation pass repaired files"
            );
            report.refresh = Some(self.refresh_all().await);
        }
        report
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    /// Whether the oldest holder's current liveness epoch began less than
    /// one warm-up window ago
    fn in_warmup(&self, entry: &MeshEntry, now: DateTime<Utc>) -> bool {
        entry
            .replicas
            .keys()
            .filter_map(|node| self.registry.last_start(node))
            .min()
            .is_some_and(|oldest| elapsed(oldest, now) < self.config.warmup_window)
    }
}
