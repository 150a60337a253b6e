//! Error types for tern-mesh

use tern_proto::{FileId, NodeId, RpcError};
use thiserror::Error;

/// Result type for tern-mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the reconciliation engine
#[derive(Error, Debug)]
pub enum Error {
    /// A call to a node failed or timed out
    #[error("RPC to node {node} failed: {source}")]
    Rpc {
        /// Target node
        node: NodeId,
        /// Transport error
        #[source]
        source: RpcError,
    },

    /// A node answered with something that could not be understood
    #[error("Malformed response from node {node}: {message}")]
    Parse {
        /// Responding node
        node: NodeId,
        /// Decoder message
        message: String,
    },

    /// The replicas of a file are in a state no repair can resolve
    #[error("Consistency fault on {file_id}: {message}")]
    Consistency {
        /// Affected file
        file_id: FileId,
        /// What was found
        message: String,
    },

    /// No alive node is eligible to take a replica
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// Unknown node
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Unknown or already deleted file
    #[error("File not found: {0}")]
    FileNotFound(FileId),

    /// Rejected request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A repair on the file did not finish within the lock wait
    #[error("File busy: {0}")]
    Busy(FileId),

    /// A multi-node operation failed on some nodes; applied writes are kept
    #[error("{operation} failed on {} of {} nodes", failed.len(), failed.len() + succeeded.len())]
    Partial {
        /// Operation name
        operation: &'static str,
        /// Nodes that acknowledged
        succeeded: Vec<NodeId>,
        /// Nodes that failed, with the reason
        failed: Vec<(NodeId, String)>,
    },

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] tern_config::ConfigError),
}

impl Error {
    /// Attribute an RPC failure to `node`
    pub fn rpc(node: impl Into<NodeId>, source: RpcError) -> Self {
        let node = node.into();
        match source {
            RpcError::Parse(message) => Error::Parse { node, message },
            source => Error::Rpc { node, source },
        }
    }

    /// Whether the failure was a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Rpc {
                source: RpcError::Timeout(_),
                ..
            }
        )
    }
}
