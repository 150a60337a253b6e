//! Request/response channel to a single node

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{NodeRequest, NodeResponse};

/// Errors raised by a node channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No response within the deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The channel is closed
    #[error("channel disconnected")]
    Disconnected,

    /// The node answered with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// The response could not be decoded
    #[error("malformed message: {0}")]
    Parse(String),
}

/// A request/response channel to one storage node.
///
/// Each call resolves at most once. Dropping the returned future abandons
/// the call and any late response is discarded by the implementation.
#[async_trait]
pub trait NodeChannel: Send + Sync {
    /// Send a request and wait for its response
    async fn call(&self, request: NodeRequest) -> Result<NodeResponse, RpcError>;

    /// Whether the underlying transport is still connected
    fn is_connected(&self) -> bool;
}

/// Shared handle to a node channel
pub type SharedChannel = Arc<dyn NodeChannel>;

/// Race a call against `timeout`
pub async fn call_with_timeout(
    channel: &dyn NodeChannel,
    request: NodeRequest,
    timeout: Duration,
) -> Result<NodeResponse, RpcError> {
    match tokio::time::timeout(timeout, channel.call(request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}
