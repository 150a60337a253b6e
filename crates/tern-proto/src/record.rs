//! Replica records and checksums

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a storage node
pub type NodeId = String;

/// Identity of a replicated file
pub type FileId = String;

/// Opaque, key-ordered file metadata (display name, size, ...)
pub type FileMeta = BTreeMap<String, Value>;

/// A node's full local index, keyed by file id
pub type FileIndex = BTreeMap<FileId, ReplicaRecord>;

/// Lifecycle status of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Record exists but content has not been committed yet
    #[default]
    Pending,
    /// Content is stored and readable
    Live,
    /// Tombstone; content has been dropped
    Deleted,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Live => write!(f, "live"),
            FileStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// One node's record of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// File id
    pub id: FileId,

    /// Monotonic per-file version; a missing version reads as 0
    #[serde(default)]
    pub version: u64,

    /// File metadata
    #[serde(default)]
    pub meta: FileMeta,

    /// CRC-32 over the rendered metadata
    #[serde(default)]
    pub meta_crc: u32,

    /// CRC-32 over the raw content
    #[serde(default)]
    pub file_crc: u32,

    /// Replica status
    #[serde(default)]
    pub status: FileStatus,

    /// When the file was first stored
    #[serde(default)]
    pub date_added: Option<DateTime<Utc>>,

    /// When the record was last changed
    #[serde(default)]
    pub date_updated: Option<DateTime<Utc>>,

    /// When the file was tombstoned
    #[serde(default)]
    pub date_deleted: Option<DateTime<Utc>>,

    /// Node-local write lock, never interpreted by the master
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub locked: bool,
}

impl ReplicaRecord {
    /// Create a pending record with the checksums of empty content
    pub fn new(id: impl Into<FileId>, version: u64, meta: FileMeta) -> Self {
        let meta_crc = meta_checksum(&meta);
        Self {
            id: id.into(),
            version,
            meta,
            meta_crc,
            file_crc: content_checksum(&[]),
            status: FileStatus::Pending,
            date_added: None,
            date_updated: None,
            date_deleted: None,
            locked: false,
        }
    }

    /// Whether the replica is live and carries no deletion timestamp
    pub fn is_live(&self) -> bool {
        self.status == FileStatus::Live && self.date_deleted.is_none()
    }

    /// Display name from metadata, if present
    pub fn display_name(&self) -> Option<&str> {
        self.meta.get("name").and_then(Value::as_str)
    }

    /// Recompute both checksums against `content`.
    ///
    /// Returns true when either stored value changed.
    pub fn refresh_checksums(&mut self, content: &[u8]) -> bool {
        let meta_crc = meta_checksum(&self.meta);
        let file_crc = content_checksum(content);
        let changed = meta_crc != self.meta_crc || file_crc != self.file_crc;
        self.meta_crc = meta_crc;
        self.file_crc = file_crc;
        changed
    }
}

/// CRC-32 (IEEE) of raw content. Missing content hashes as the empty slice.
pub fn content_checksum(content: &[u8]) -> u32 {
    crc32fast::hash(content)
}

/// CRC-32 of metadata rendered as sorted `key:value` pairs joined by `/`.
///
/// String values render without quotes; every other value renders as
/// compact JSON.
pub fn meta_checksum(meta: &FileMeta) -> u32 {
    let rendered = meta
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}:{s}"),
            other => format!("{key}:{other}"),
        })
        .collect::<Vec<_>>()
        .join("/");
    crc32fast::hash(rendered.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> FileMeta {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_content_checksum() {
        assert_eq!(content_checksum(&[]), 0);
        assert_ne!(content_checksum(b"hello"), 0);
    }

    #[test]
    fn test_meta_checksum_rendering() {
        let m = meta(&[("size", json!(5)), ("name", json!("a.txt"))]);
        assert_eq!(meta_checksum(&m), crc32fast::hash(b"name:a.txt/size:5"));
    }

    #[test]
    fn test_meta_checksum_changes_with_values() {
        let a = meta(&[("name", json!("a.txt"))]);
        let b = meta(&[("name", json!("b.txt"))]);
        assert_ne!(meta_checksum(&a), meta_checksum(&b));
    }

    #[test]
    fn test_missing_version_reads_as_zero() {
        let record: ReplicaRecord = serde_json::from_value(json!({
            "id": "f1",
            "status": "live"
        }))
        .unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.status, FileStatus::Live);
        assert!(!record.locked);
    }

    #[test]
    fn test_refresh_checksums_reports_change() {
        let mut record = ReplicaRecord::new("f1", 1, meta(&[("name", json!("x"))]));
        assert!(record.refresh_checksums(b"content"));
        assert!(!record.refresh_checksums(b"content"));
        assert_eq!(record.file_crc, content_checksum(b"content"));
    }

    #[test]
    fn test_is_live() {
        let mut record = ReplicaRecord::new("f1", 1, FileMeta::new());
        assert!(!record.is_live());
        record.status = FileStatus::Live;
        assert!(record.is_live());
        record.date_deleted = Some(Utc::now());
        assert!(!record.is_live());
    }

    #[test]
    fn test_locked_not_serialized_when_clear() {
        let record = ReplicaRecord::new("f1", 1, FileMeta::new());
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("locked").is_none());
    }
}
