//! Global per-file view built from node snapshots
//!
//! A [`Mesh`] is a disposable projection: it is rebuilt from scratch from
//! the raw per-node indexes whenever any snapshot changes, and swapped in
//! whole. Holders of an older `Arc<Mesh>` keep a consistent, stale view.

use std::collections::BTreeMap;

use serde::Serialize;
use tern_proto::{FileId, FileIndex, FileMeta, NodeId, ReplicaRecord};

/// The master's view of one file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshEntry {
    /// File id
    pub id: FileId,

    /// Metadata of the last contributing replica, not reconciled
    pub meta: FileMeta,

    /// Replicas by node, in node id order
    pub replicas: BTreeMap<NodeId, ReplicaRecord>,

    /// Whether a repair is in flight for this file
    pub locked: bool,
}

impl MeshEntry {
    fn new(id: FileId) -> Self {
        Self {
            id,
            meta: FileMeta::new(),
            replicas: BTreeMap::new(),
            locked: false,
        }
    }

    /// Number of nodes holding a record for this file
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// First replica in node order
    pub fn representative(&self) -> Option<(&NodeId, &ReplicaRecord)> {
        self.replicas.iter().next()
    }

    /// Nodes holding a record for this file
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.replicas.keys().cloned().collect()
    }

    /// Whether `node` holds a record for this file
    pub fn is_held_by(&self, node: &str) -> bool {
        self.replicas.contains_key(node)
    }

    /// Highest version among replicas; missing versions read as 0
    pub fn current_version(&self) -> u64 {
        self.replicas.values().map(|r| r.version).max().unwrap_or(0)
    }
}

/// Aggregated view of all files across all nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mesh {
    entries: BTreeMap<FileId, MeshEntry>,
}

impl Mesh {
    /// Build the mesh from every node's snapshot in one pass
    pub fn build(snapshots: &BTreeMap<NodeId, FileIndex>) -> Self {
        let mut entries: BTreeMap<FileId, MeshEntry> = BTreeMap::new();
        for (node, index) in snapshots {
            for (file_id, record) in index {
                let entry = entries
                    .entry(file_id.clone())
                    .or_insert_with(|| MeshEntry::new(file_id.clone()));
                entry.meta = record.meta.clone();
                entry.replicas.insert(node.clone(), record.clone());
            }
        }
        Self { entries }
    }

    /// Entry for `file_id`
    pub fn get(&self, file_id: &str) -> Option<&MeshEntry> {
        self.entries.get(file_id)
    }

    /// All entries in file id order
    pub fn entries(&self) -> impl Iterator<Item = &MeshEntry> {
        self.entries.values()
    }

    /// Number of distinct files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mesh holds no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of replica records
    pub fn replica_total(&self) -> usize {
        self.entries.values().map(MeshEntry::replica_count).sum()
    }
}
