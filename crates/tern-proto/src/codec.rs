//! JSON framing for node messages

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::RpcError;

/// Encode a message to its JSON wire form
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(message).map_err(|e| RpcError::Parse(e.to_string()))
}

/// Decode a message from its JSON wire form
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, RpcError> {
    serde_json::from_slice(frame).map_err(|e| RpcError::Parse(e.to_string()))
}
