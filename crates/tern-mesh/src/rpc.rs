//! Deadline-bounded calls to nodes

use std::collections::BTreeMap;
use std::time::Duration;

use tern_proto::{call_with_timeout, NodeId, NodeRequest, NodeResponse, RpcError, SharedChannel};
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{Error, Result};

/// One call with a deadline, attributed to `node` on failure
pub(crate) async fn call(
    node: &str,
    channel: &SharedChannel,
    request: NodeRequest,
    timeout: Duration,
) -> Result<NodeResponse> {
    call_with_timeout(channel.as_ref(), request, timeout)
        .await
        .map_err(|e| Error::rpc(node, e))
}

/// Issue one request per target concurrently and wait for every call to settle.
///
/// Results come back in node id order.
pub(crate) async fn fan_out(
    targets: Vec<(NodeId, SharedChannel, NodeRequest)>,
    timeout: Duration,
) -> Vec<(NodeId, std::result::Result<NodeResponse, RpcError>)> {
    let mut pending: BTreeMap<NodeId, std::result::Result<NodeResponse, RpcError>> = targets
        .iter()
        .map(|(node, _, _)| {
            (
                node.clone(),
                Err(RpcError::Remote("call did not complete".into())),
            )
        })
        .collect();

    let mut calls = JoinSet::new();
    for (node, channel, request) in targets {
        calls.spawn(async move {
            let result = call_with_timeout(channel.as_ref(), request, timeout).await;
            (node, result)
        });
    }

    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok((node, result)) => {
                pending.insert(node, result);
            }
            Err(e) => warn!(error = %e, "RPC task aborted"),
        }
    }

    pending.into_iter().collect()
}
