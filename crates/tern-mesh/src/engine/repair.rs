//! Single-replica repair procedures
//!
//! Every procedure touches at most one replica of one file. The caller holds
//! the file's repair lock for the whole call.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use tern_proto::{
    AddFile, DeleteFile, FileStatus, NodeId, NodeRequest, SharedChannel, UpdateFile,
};
use tracing::info;

use super::ReplicationEngine;
use crate::error::{Error, Result};
use crate::mesh::MeshEntry;
use crate::metrics::RepairMetrics;
use crate::quorum::{self, MismatchKind};
use crate::rpc;

/// What a successful repair changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// A replica was copied onto `node`
    Added { node: NodeId },
    /// `node`'s replica was removed
    Removed { node: NodeId },
    /// `node`'s replica was overwritten from `from`
    Fixed {
        node: NodeId,
        from: NodeId,
        kind: MismatchKind,
    },
    /// The mismatch was gone by the time the fix was planned
    Unchanged,
}

/// Repair chosen for a file by a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepairAction {
    AddReplica,
    RemoveExcess,
    Fix(MismatchKind),
}

impl RepairAction {
    pub(crate) fn record_attempt(self, metrics: &RepairMetrics) {
        match self {
            RepairAction::AddReplica => metrics.record_add_attempt(),
            RepairAction::RemoveExcess => metrics.record_removal_attempt(),
            RepairAction::Fix(kind) => metrics.record_fix_attempt(kind),
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::AddReplica => write!(f, "add_replica"),
            RepairAction::RemoveExcess => write!(f, "remove_excess"),
            RepairAction::Fix(kind) => write!(f, "fix_{kind}"),
        }
    }
}

impl ReplicationEngine {
    pub(crate) async fn run_repair(
        &self,
        action: RepairAction,
        entry: &MeshEntry,
    ) -> Result<RepairOutcome> {
        match action {
            RepairAction::AddReplica => self.add_replica(entry).await,
            RepairAction::RemoveExcess => self.remove_excess(entry).await,
            RepairAction::Fix(_) => self.fix_replica(entry).await,
        }
    }

    /// Copy the file from its first reachable holder onto the least-loaded
    /// alive node that does not hold it yet
    async fn add_replica(&self, entry: &MeshEntry) -> Result<RepairOutcome> {
        let holders: BTreeSet<NodeId> = entry.replicas.keys().cloned().collect();
        let (target, target_channel) = self.registry.place_new_replica(&holders)?;
        let (source, source_channel) = self.first_reachable_holder(entry)?;
        let timeout = self.config.add_timeout;

        let (record, data) = rpc::call(
            &source,
            &source_channel,
            NodeRequest::QueryFile {
                id: entry.id.clone(),
                include_content: true,
            },
            timeout,
        )
        .await?
        .into_file()
        .map_err(|e| Error::rpc(source.as_str(), e))?;

        let data = match record.status {
            FileStatus::Deleted => Bytes::new(),
            _ => data.unwrap_or_default(),
        };

        rpc::call(
            &target,
            &target_channel,
            NodeRequest::Add(AddFile {
                id: record.id,
                version: record.version,
                data,
                meta: record.meta,
                status: Some(record.status),
            }),
            timeout,
        )
        .await?
        .into_ack()
        .map_err(|e| Error::rpc(target.as_str(), e))?;

        self.registry.note_replica_added(&target);
        info!(
            file_id = %entry.id,
            node_id = %target,
            source = %source,
            version = record.version,
            "Replica added"
        );
        Ok(RepairOutcome::Added { node: target })
    }

    /// Force-remove the replica held by the most-loaded alive holder
    async fn remove_excess(&self, entry: &MeshEntry) -> Result<RepairOutcome> {
        let (victim, channel) = self
            .registry
            .most_loaded(entry.replicas.keys())
            .ok_or_else(|| Error::Consistency {
                file_id: entry.id.clone(),
                message: "no alive holder to remove from".into(),
            })?;
        let version = entry.replicas.get(&victim).map_or(0, |r| r.version);

        rpc::call(
            &victim,
            &channel,
            NodeRequest::Delete(DeleteFile {
                id: entry.id.clone(),
                version,
                force: true,
            }),
            self.config.delete_timeout,
        )
        .await?
        .into_ack()
        .map_err(|e| Error::rpc(victim.as_str(), e))?;

        info!(file_id = %entry.id, node_id = %victim, "Excess replica removed");
        Ok(RepairOutcome::Removed { node: victim })
    }

    /// Overwrite one faulty replica with the authoritative record.
    ///
    /// Content travels only for version and content mismatches, and never
    /// for tombstones.
    async fn fix_replica(&self, entry: &MeshEntry) -> Result<RepairOutcome> {
        let Some(plan) = quorum::plan_fix(&entry.replicas) else {
            info!(file_id = %entry.id, "Replicas agree, nothing to fix");
            return Ok(RepairOutcome::Unchanged);
        };

        let source_channel = self.reachable(&plan.authoritative)?;
        let target_channel = self.reachable(&plan.faulty)?;
        let timeout = self.config.repair_timeout;
        let with_content = plan.kind != MismatchKind::MetaCrc;

        let (record, data) = rpc::call(
            &plan.authoritative,
            &source_channel,
            NodeRequest::QueryFile {
                id: entry.id.clone(),
                include_content: with_content,
            },
            timeout,
        )
        .await?
        .into_file()
        .map_err(|e| Error::rpc(plan.authoritative.as_str(), e))?;

        let data = match record.status {
            FileStatus::Deleted => None,
            _ if with_content => data,
            _ => None,
        };

        rpc::call(
            &plan.faulty,
            &target_channel,
            NodeRequest::Update(UpdateFile::from_record(&record, data)),
            timeout,
        )
        .await?
        .into_ack()
        .map_err(|e| Error::rpc(plan.faulty.as_str(), e))?;

        info!(
            file_id = %entry.id,
            kind = %plan.kind,
            authoritative = %plan.authoritative,
            faulty = %plan.faulty,
            version = record.version,
            "Replica fixed"
        );
        Ok(RepairOutcome::Fixed {
            node: plan.faulty,
            from: plan.authoritative,
            kind: plan.kind,
        })
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    fn first_reachable_holder(&self, entry: &MeshEntry) -> Result<(NodeId, SharedChannel)> {
        entry
            .replicas
            .keys()
            .find_map(|node| {
                self.registry
                    .live_channel(node)
                    .map(|channel| (node.clone(), channel))
            })
            .ok_or_else(|| Error::Consistency {
                file_id: entry.id.clone(),
                message: "no reachable replica to copy from".into(),
            })
    }

    fn reachable(&self, node: &str) -> Result<SharedChannel> {
        self.registry
            .live_channel(node)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))
    }
}
