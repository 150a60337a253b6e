//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tern_mesh::{Coordinator, HeartbeatOutcome, ManualClock, MeshConfig, ReplicationEngine};
use tern_proto::{
    AddFile, FileMeta, FileStatus, Heartbeat, NodeChannel, NodeRequest, NodeResponse,
    ReplicaRecord, RpcError, SharedChannel,
};
use tern_store::{LocalChannel, StorageNode};

/// A node that accepts requests and never answers
pub struct StalledChannel;

#[async_trait]
impl NodeChannel for StalledChannel {
    async fn call(&self, _request: NodeRequest) -> Result<NodeResponse, RpcError> {
        std::future::pending().await
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Coordinator plus in-memory storage nodes on a manual clock
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub coordinator: Coordinator,
    pub nodes: BTreeMap<String, Arc<StorageNode>>,
    pub channels: BTreeMap<String, LocalChannel>,
}

impl TestCluster {
    /// Start one in-memory node per id and register each with a heartbeat
    pub fn new(ids: &[&str]) -> Self {
        let clock = Arc::new(ManualClock::default());
        let coordinator = Coordinator::with_clock(MeshConfig::default(), clock.clone());

        let mut cluster = Self {
            clock,
            coordinator,
            nodes: BTreeMap::new(),
            channels: BTreeMap::new(),
        };
        for id in ids {
            cluster.add_node(id);
        }
        cluster
    }

    /// Start and register one more node
    pub fn add_node(&mut self, id: &str) {
        let node = Arc::new(StorageNode::in_memory(id));
        let channel = LocalChannel::spawn(Arc::clone(&node));
        self.nodes.insert(id.to_string(), node);
        self.channels.insert(id.to_string(), channel);
        self.heartbeat(id);
    }

    /// Register a node whose channel never answers
    pub fn add_stalled(&self, id: &str) {
        let channel: SharedChannel = Arc::new(StalledChannel);
        self.coordinator.registry().record_heartbeat(
            &Heartbeat {
                id: id.to_string(),
                file_count: 0,
            },
            channel,
        );
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        self.coordinator.engine()
    }

    pub fn node(&self, id: &str) -> &Arc<StorageNode> {
        &self.nodes[id]
    }

    /// Heartbeat with the node's real file count
    pub fn heartbeat(&self, id: &str) -> HeartbeatOutcome {
        let report = self.node(id).heartbeat();
        self.heartbeat_with_count(id, report.file_count)
    }

    /// Heartbeat reporting an arbitrary file count
    pub fn heartbeat_with_count(&self, id: &str, file_count: u64) -> HeartbeatOutcome {
        let channel: SharedChannel = Arc::new(self.channels[id].clone());
        self.coordinator.registry().record_heartbeat(
            &Heartbeat {
                id: id.to_string(),
                file_count,
            },
            channel,
        )
    }

    pub fn heartbeat_all(&self) {
        for id in self.nodes.keys() {
            self.heartbeat(id);
        }
    }

    /// Move the clock past the warm-up window and keep every node alive
    pub fn warm_up(&self) {
        self.clock.advance(Duration::from_secs(16));
        self.heartbeat_all();
    }

    /// Store a live file directly on one node
    pub async fn seed(&self, id: &str, file_id: &str, version: u64, content: &[u8]) {
        self.seed_with_meta(id, file_id, version, content, meta(file_id))
            .await;
    }

    /// Store a live file with explicit metadata
    pub async fn seed_with_meta(
        &self,
        id: &str,
        file_id: &str,
        version: u64,
        content: &[u8],
        meta: FileMeta,
    ) {
        self.node(id)
            .add_file(AddFile {
                id: file_id.to_string(),
                version,
                data: Bytes::copy_from_slice(content),
                meta,
                status: Some(FileStatus::Live),
            })
            .await
            .unwrap();
    }

    /// Record for `file_id` on node `id`
    pub fn record(&self, id: &str, file_id: &str) -> Option<ReplicaRecord> {
        self.node(id).query_index().get(file_id).cloned()
    }

    /// Stored content for `file_id` on node `id`
    pub async fn content(&self, id: &str, file_id: &str) -> Bytes {
        let (_, data) = self.node(id).get_file(file_id, true).await.unwrap();
        data.unwrap_or_default()
    }

    /// Nodes currently holding a record for `file_id`
    pub fn holders(&self, file_id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.query_index().contains_key(file_id))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Metadata every seeded file carries
pub fn meta(file_id: &str) -> FileMeta {
    let mut meta = FileMeta::new();
    meta.insert("name".into(), json!(format!("{file_id}.txt")));
    meta
}
