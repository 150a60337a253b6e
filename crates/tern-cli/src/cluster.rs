//! In-process cluster: one coordinator plus storage nodes on local channels

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tern_config::TernConfig;
use tern_mesh::{Clock, Coordinator, MeshConfig};
use tern_proto::{Heartbeat, NodeChannel};
use tern_store::{LocalChannel, NodeDaemon, NodeDaemonConfig, NodeOptions, StorageNode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Heartbeats buffered between the node daemons and the coordinator
const HEARTBEAT_BUFFER: usize = 256;

pub struct Member {
    pub node: Arc<StorageNode>,
    pub channel: LocalChannel,
}

pub struct Cluster {
    coordinator: Arc<Coordinator>,
    members: BTreeMap<String, Member>,
    daemons: Vec<NodeDaemon>,
    router: Option<JoinHandle<()>>,
}

impl Cluster {
    /// Open `count` nodes named `node-1..` and register each with the coordinator
    pub async fn open(
        config: &TernConfig,
        clock: Arc<dyn Clock>,
        count: usize,
        data_dir: Option<&Path>,
    ) -> Result<Self> {
        let coordinator = Arc::new(Coordinator::with_clock(
            MeshConfig::from(&config.mesh),
            clock,
        ));
        let options = NodeOptions {
            tombstone_retention: config.node.tombstone_retention(),
        };
        let root = data_dir.or(config.node.storage_root.as_deref());

        let mut members = BTreeMap::new();
        for i in 1..=count {
            let id = format!("node-{i}");
            let node = match root {
                Some(root) => StorageNode::open(&id, root.join(&id), options.clone())
                    .await
                    .with_context(|| format!("Failed to open {id}"))?,
                None => StorageNode::new(
                    &id,
                    Arc::new(tern_store::MemoryBlobStore::new()),
                    options.clone(),
                ),
            };
            let node = Arc::new(node);
            let channel = LocalChannel::spawn(Arc::clone(&node));
            members.insert(id, Member { node, channel });
        }

        let cluster = Self {
            coordinator,
            members,
            daemons: Vec::new(),
            router: None,
        };
        cluster.heartbeat_all();
        info!(nodes = count, "Cluster opened");
        Ok(cluster)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    /// Send one heartbeat per connected node
    pub fn heartbeat_all(&self) {
        for member in self.members.values() {
            if member.channel.is_connected() {
                self.coordinator
                    .handle_heartbeat(&member.node.heartbeat(), Arc::new(member.channel.clone()));
            }
        }
    }

    /// Start node daemons and route their heartbeats to the coordinator
    pub fn start_daemons(&mut self, config: &TernConfig) {
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<Heartbeat>(HEARTBEAT_BUFFER);

        let channels: BTreeMap<String, LocalChannel> = self
            .members
            .iter()
            .map(|(id, member)| (id.clone(), member.channel.clone()))
            .collect();
        let coordinator = Arc::clone(&self.coordinator);
        self.router = Some(tokio::spawn(async move {
            while let Some(report) = heartbeat_rx.recv().await {
                match channels.get(&report.id) {
                    Some(channel) => {
                        coordinator.handle_heartbeat(&report, Arc::new(channel.clone()));
                    }
                    None => debug!(node_id = %report.id, "Heartbeat from unknown node"),
                }
            }
        }));

        let daemon_config = NodeDaemonConfig {
            heartbeat_interval: config.node.heartbeat_interval(),
            integrity_interval: config.node.integrity_check_interval(),
        };
        for member in self.members.values() {
            let daemon = NodeDaemon::new(daemon_config.clone(), Arc::clone(&member.node));
            daemon.start(heartbeat_tx.clone());
            self.daemons.push(daemon);
        }
    }

    /// Stop daemons and the coordinator loops
    pub async fn shutdown(mut self) -> Result<()> {
        for daemon in self.daemons.drain(..) {
            daemon.stop().await;
        }
        if let Some(router) = self.router.take() {
            router.abort();
        }
        self.coordinator.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tern_mesh::ManualClock;

    #[tokio::test]
    async fn test_open_registers_every_node() {
        let config = TernConfig::default();
        let cluster = Cluster::open(&config, Arc::new(ManualClock::default()), 3, None)
            .await
            .unwrap();

        let nodes = cluster.coordinator().list_nodes();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.alive));
        assert!(cluster.member("node-2").is_some());
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_members_stop_heartbeating() {
        let config = TernConfig::default();
        let cluster = Cluster::open(&config, Arc::new(ManualClock::default()), 2, None)
            .await
            .unwrap();

        cluster.member("node-1").unwrap().channel.disconnect();
        cluster.coordinator().engine().refresh_all().await;
        cluster.heartbeat_all();
        assert!(!cluster.coordinator().registry().is_alive("node-1"));
        assert!(cluster.coordinator().registry().is_alive("node-2"));
    }

    #[tokio::test]
    async fn test_data_dir_persists_node_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let config = TernConfig::default();
        let cluster = Cluster::open(&config, Arc::new(ManualClock::default()), 3, Some(dir.path()))
            .await
            .unwrap();

        let content = Bytes::from_static(b"persisted");
        let replicas = cluster
            .coordinator()
            .add_file(content.clone(), "p.txt", content.len() as u64)
            .await
            .unwrap();
        assert_eq!(replicas, 3);

        for id in ["node-1", "node-2", "node-3"] {
            assert!(dir.path().join(id).join("index.json").exists(), "{id}");
        }
    }
}
