//! In-process node transport
//!
//! Requests and responses travel as encoded JSON frames over tokio
//! channels, so a [`LocalChannel`] exercises the same codec path a network
//! transport would. Each request carries its own oneshot reply sender; a
//! caller that gives up drops the receiver and the late reply is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tern_proto::{codec, NodeChannel, NodeRequest, NodeResponse, RpcError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::node::StorageNode;

/// Pending requests buffered per node
const CHANNEL_CAPACITY: usize = 64;

/// One encoded request awaiting a reply
#[derive(Debug)]
pub struct Envelope {
    /// Encoded `NodeRequest`
    pub frame: Vec<u8>,
    /// Channel to send the encoded `NodeResponse`
    pub response_tx: oneshot::Sender<Vec<u8>>,
}

/// Channel to a storage node running in the same process
#[derive(Clone)]
pub struct LocalChannel {
    /// Target node
    node_id: String,

    /// Request sender
    sender: mpsc::Sender<Envelope>,

    /// Connection flag shared by all clones
    connected: Arc<AtomicBool>,
}

impl LocalChannel {
    /// Spawn a serve task for `node` and return a channel to it
    pub fn spawn(node: Arc<StorageNode>) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let node_id = node.id().to_string();
        tokio::spawn(serve(node, receiver));

        Self {
            node_id,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Target node id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Mark the channel closed; calls fail with `Disconnected`
    pub fn disconnect(&self) {
        debug!(node_id = %self.node_id, "Channel disconnected");
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Reopen a previously closed channel
    pub fn reconnect(&self) {
        debug!(node_id = %self.node_id, "Channel reconnected");
        self.connected.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("node_id", &self.node_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl NodeChannel for LocalChannel {
    async fn call(&self, request: NodeRequest) -> Result<NodeResponse, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }

        trace!(node_id = %self.node_id, op = request.op(), "Sending request");
        let frame = codec::encode(&request)?;
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(Envelope { frame, response_tx })
            .await
            .map_err(|_| RpcError::Disconnected)?;

        let reply = response_rx.await.map_err(|_| RpcError::Disconnected)?;
        match codec::decode::<NodeResponse>(&reply)? {
            NodeResponse::Error { message } => Err(RpcError::Remote(message)),
            response => Ok(response),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }
}

async fn serve(node: Arc<StorageNode>, mut receiver: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let response = match codec::decode::<NodeRequest>(&envelope.frame) {
                Ok(request) => match node.handle(request).await {
                    Ok(response) => response,
                    Err(e) => NodeResponse::Error {
                        message: e.to_string(),
                    },
                },
                Err(e) => NodeResponse::Error {
                    message: e.to_string(),
                },
            };

            match codec::encode(&response) {
                Ok(frame) => {
                    // The caller may have timed out already
                    let _ = envelope.response_tx.send(frame);
                }
                Err(e) => debug!(node_id = %node.id(), error = %e, "Failed to encode response"),
            }
        });
    }
    debug!(node_id = %node.id(), "Serve loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tern_proto::{AddFile, FileMeta};

    #[tokio::test]
    async fn test_call_round_trips_through_codec() {
        let node = Arc::new(StorageNode::in_memory("n1"));
        let channel = LocalChannel::spawn(Arc::clone(&node));

        let response = channel
            .call(NodeRequest::Add(AddFile {
                id: "f1".into(),
                version: 1,
                data: Bytes::from_static(b"abc"),
                meta: FileMeta::new(),
                status: None,
            }))
            .await
            .unwrap();
        assert_eq!(response, NodeResponse::Ack);
        assert_eq!(node.file_count(), 1);

        let (record, data) = channel
            .call(NodeRequest::QueryFile {
                id: "f1".into(),
                include_content: true,
            })
            .await
            .unwrap()
            .into_file()
            .unwrap();
        assert_eq!(record.id, "f1");
        assert_eq!(data.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_node_error_becomes_remote() {
        let channel = LocalChannel::spawn(Arc::new(StorageNode::in_memory("n1")));
        let err = channel
            .call(NodeRequest::QueryFile {
                id: "missing".into(),
                include_content: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn test_disconnected_channel_rejects_calls() {
        let channel = LocalChannel::spawn(Arc::new(StorageNode::in_memory("n1")));
        channel.disconnect();
        assert!(!channel.is_connected());
        assert_eq!(
            channel.call(NodeRequest::QueryIndex).await.unwrap_err(),
            RpcError::Disconnected
        );

        channel.reconnect();
        assert!(channel.call(NodeRequest::QueryIndex).await.is_ok());
    }
}
