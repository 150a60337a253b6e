//! Node RPC messages

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::RpcError;
use crate::record::{FileId, FileIndex, FileMeta, FileStatus, NodeId, ReplicaRecord};

/// Periodic liveness report sent by a node to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Reporting node
    pub id: NodeId,
    /// Number of records on the node that are not tombstoned
    pub file_count: u64,
}

/// Store a new file on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFile {
    pub id: FileId,
    #[serde(default)]
    pub version: u64,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    #[serde(default)]
    pub meta: FileMeta,
    /// Status to commit with; `live` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
}

/// Overwrite an existing record, optionally with new content
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateFile {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_deleted: Option<DateTime<Utc>>,
    /// Replacement content; empty or absent leaves stored bytes untouched
    #[serde(
        default,
        with = "base64_opt_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Bytes>,
}

impl UpdateFile {
    /// Build an update that copies every field of `record` onto a replica
    pub fn from_record(record: &ReplicaRecord, data: Option<Bytes>) -> Self {
        Self {
            id: record.id.clone(),
            version: Some(record.version),
            meta: Some(record.meta.clone()),
            status: Some(record.status),
            date_added: record.date_added,
            date_updated: record.date_updated,
            date_deleted: record.date_deleted,
            data,
        }
    }
}

/// Tombstone or remove a file on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFile {
    pub id: FileId,
    #[serde(default)]
    pub version: u64,
    /// Remove the record entirely instead of tombstoning it
    #[serde(default)]
    pub force: bool,
}

/// Request sent from the master to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeRequest {
    /// Return the node's whole file index
    QueryIndex,
    /// Return one record, optionally with its content
    QueryFile {
        id: FileId,
        #[serde(default)]
        include_content: bool,
    },
    Add(AddFile),
    Update(UpdateFile),
    Delete(DeleteFile),
}

impl NodeRequest {
    /// Short operation name for logs
    pub fn op(&self) -> &'static str {
        match self {
            NodeRequest::QueryIndex => "query_index",
            NodeRequest::QueryFile { .. } => "query_file",
            NodeRequest::Add(_) => "add",
            NodeRequest::Update(_) => "update",
            NodeRequest::Delete(_) => "delete",
        }
    }
}

/// Response sent from a node to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeResponse {
    Index {
        files: FileIndex,
    },
    File {
        record: ReplicaRecord,
        #[serde(
            default,
            with = "base64_opt_bytes",
            skip_serializing_if = "Option::is_none"
        )]
        data: Option<Bytes>,
    },
    Ack,
    /// The node rejected the request
    Error {
        message: String,
    },
}

impl NodeResponse {
    fn kind(&self) -> &'static str {
        match self {
            NodeResponse::Index { .. } => "index",
            NodeResponse::File { .. } => "file",
            NodeResponse::Ack => "ack",
            NodeResponse::Error { .. } => "error",
        }
    }

    fn unexpected(self, expected: &str) -> RpcError {
        match self {
            NodeResponse::Error { message } => RpcError::Remote(message),
            other => RpcError::Parse(format!("expected {expected}, got {}", other.kind())),
        }
    }

    /// Unwrap an index response
    pub fn into_index(self) -> Result<FileIndex, RpcError> {
        match self {
            NodeResponse::Index { files } => Ok(files),
            other => Err(other.unexpected("index")),
        }
    }

    /// Unwrap a file response
    pub fn into_file(self) -> Result<(ReplicaRecord, Option<Bytes>), RpcError> {
        match self {
            NodeResponse::File { record, data } => Ok((record, data)),
            other => Err(other.unexpected("file")),
        }
    }

    /// Unwrap an acknowledgement
    pub fn into_ack(self) -> Result<(), RpcError> {
        match self {
            NodeResponse::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => serializer.serialize_some(&STANDARD.encode(data)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
