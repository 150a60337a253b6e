//! Storage node: local file index plus blob content

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tern_proto::{
    meta_checksum, AddFile, DeleteFile, FileIndex, FileStatus, Heartbeat, NodeId,
    NodeRequest, NodeResponse, ReplicaRecord, UpdateFile,
};
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::error::{Error, Result};

const INDEX_FILE: &str = "index.json";

/// Storage node options
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// How long tombstones are kept before the integrity sweep purges them
    pub tombstone_retention: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::from_secs(48 * 60 * 60),
        }
    }
}

/// Outcome of one integrity sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Records whose checksums were recomputed
    pub checked: usize,
    /// Records whose stored checksums were wrong
    pub corrected: usize,
    /// Tombstones purged past retention
    pub purged: usize,
}

/// A storage node
pub struct StorageNode {
    /// Node id
    id: NodeId,

    /// Options
    options: NodeOptions,

    /// Local file index
    index: RwLock<FileIndex>,

    /// Raw content
    blobs: Arc<dyn BlobStore>,

    /// Where the index is persisted, if anywhere
    index_path: Option<PathBuf>,
}

impl StorageNode {
    /// Create a node backed by an arbitrary blob store, without index persistence
    pub fn new(id: impl Into<NodeId>, blobs: Arc<dyn BlobStore>, options: NodeOptions) -> Self {
        Self {
            id: id.into(),
            options,
            index: RwLock::new(FileIndex::new()),
            blobs,
            index_path: None,
        }
    }

    /// Create a node that keeps everything in memory
    pub fn in_memory(id: impl Into<NodeId>) -> Self {
        Self::new(id, Arc::new(MemoryBlobStore::new()), NodeOptions::default())
    }

    /// Open a node rooted at `dir`, loading a previously persisted index
    pub async fn open(
        id: impl Into<NodeId>,
        dir: impl AsRef<Path>,
        options: NodeOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let blobs = FsBlobStore::new(dir.join("blobs")).await?;
        let index_path = dir.join(INDEX_FILE);

        let index = match tokio::fs::read(&index_path).await {
            Ok(raw) => serde_json::from_slice::<FileIndex>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileIndex::new(),
            Err(e) => return Err(e.into()),
        };

        let id = id.into();
        info!(node_id = %id, files = index.len(), dir = %dir.display(), "Opened storage node");

        Ok(Self {
            id,
            options,
            index: RwLock::new(index),
            blobs: Arc::new(blobs),
            index_path: Some(index_path),
        })
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of records that are not tombstoned
    pub fn file_count(&self) -> u64 {
        self.index
            .read()
            .values()
            .filter(|r| r.status != FileStatus::Deleted)
            .count() as u64
    }

    /// Current liveness report
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            id: self.id.clone(),
            file_count: self.file_count(),
        }
    }

    /// Snapshot of the whole index
    pub fn query_index(&self) -> FileIndex {
        self.index.read().clone()
    }

    /// One record, stripped of the node-local lock flag, plus optional content
    pub async fn get_file(
        &self,
        id: &str,
        include_content: bool,
    ) -> Result<(ReplicaRecord, Option<Bytes>)> {
        let mut record = self
            .index
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(id.to_string()))?;
        record.locked = false;

        let data = if include_content {
            Some(self.blobs.get(id).await?.unwrap_or_default())
        } else {
            None
        };
        Ok((record, data))
    }

    /// Store a new file
    pub async fn add_file(&self, add: AddFile) -> Result<()> {
        if add.id.is_empty() {
            return Err(Error::InvalidInput("empty file id".into()));
        }

        let now = Utc::now();
        let mut record = ReplicaRecord::new(add.id.clone(), add.version, add.meta);
        record.date_added = Some(now);
        record.date_updated = Some(now);
        record.locked = true;
        self.index.write().insert(add.id.clone(), record.clone());

        let status = add.status.unwrap_or(FileStatus::Live);
        let stored = if status == FileStatus::Deleted {
            self.blobs.delete(&add.id).await
        } else {
            self.blobs.put(&add.id, add.data.clone()).await
        };
        if let Err(e) = stored {
            warn!(node_id = %self.id, file_id = %add.id, error = %e, "Failed to store content");
            self.index.write().remove(&add.id);
            return Err(e);
        }

        if status == FileStatus::Deleted {
            record.refresh_checksums(&[]);
        } else {
            record.refresh_checksums(&add.data);
        }
        record.status = status;
        record.locked = false;
        self.index.write().insert(add.id.clone(), record);

        debug!(node_id = %self.id, file_id = %add.id, version = add.version, "Added file");
        self.persist().await
    }

    /// Overwrite an existing record
    pub async fn update_file(&self, update: UpdateFile) -> Result<()> {
        let current = self.lock_record(&update.id)?;
        let result = self.apply_update(&current, update).await;
        if result.is_err() {
            self.unlock_record(&current.id);
        }
        result
    }

    /// Tombstone a file, or remove it entirely when `force` is set
    pub async fn delete_file(&self, delete: DeleteFile) -> Result<()> {
        let current = self.lock_record(&delete.id)?;
        if let Err(e) = self.blobs.delete(&delete.id).await {
            self.unlock_record(&current.id);
            return Err(e);
        }

        if delete.force {
            self.index.write().remove(&delete.id);
            debug!(node_id = %self.id, file_id = %delete.id, "Removed file");
        } else {
            let mut record = current;
            record.status = FileStatus::Deleted;
            record
                .meta
                .insert("deleted".to_string(), Value::Bool(true));
            record.date_deleted = Some(Utc::now());
            record.version = delete.version;
            record.refresh_checksums(&[]);
            record.locked = false;
            self.index.write().insert(delete.id.clone(), record);
            debug!(node_id = %self.id, file_id = %delete.id, version = delete.version, "Tombstoned file");
        }

        self.persist().await
    }

    /// Dispatch one RPC request
    pub async fn handle(&self, request: NodeRequest) -> Result<NodeResponse> {
        match request {
            NodeRequest::QueryIndex => Ok(NodeResponse::Index {
                files: self.query_index(),
            }),
            NodeRequest::QueryFile {
                id,
                include_content,
            } => {
                let (record, data) = self.get_file(&id, include_content).await?;
                Ok(NodeResponse::File { record, data })
            }
            NodeRequest::Add(add) => self.add_file(add).await.map(|_| NodeResponse::Ack),
            NodeRequest::Update(update) => {
                self.update_file(update).await.map(|_| NodeResponse::Ack)
            }
            NodeRequest::Delete(delete) => {
                self.delete_file(delete).await.map(|_| NodeResponse::Ack)
            }
        }
    }

    /// Recompute checksums and purge expired tombstones
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        self.integrity_check_at(Utc::now()).await
    }

    /// Integrity sweep evaluated at `now`
    pub async fn integrity_check_at(&self, now: DateTime<Utc>) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let retention = chrono::Duration::from_std(self.options.tombstone_retention)
            .unwrap_or(chrono::Duration::MAX);

        let snapshot: Vec<ReplicaRecord> = self.index.read().values().cloned().collect();
        for record in snapshot {
            if record.locked {
                continue;
            }

            let expired = record.status == FileStatus::Deleted
                && record
                    .date_deleted
                    .is_some_and(|deleted| now - deleted > retention);
            if expired {
                self.blobs.delete(&record.id).await?;
                self.index.write().remove(&record.id);
                report.purged += 1;
                info!(node_id = %self.id, file_id = %record.id, "Purged expired tombstone");
                continue;
            }

            let file_crc = self.blobs.checksum(&record.id).await?;
            report.checked += 1;

            if self.correct_checksums(&record.id, file_crc) {
                report.corrected += 1;
            }
        }

        if report.corrected > 0 || report.purged > 0 {
            self.persist().await?;
        }
        Ok(report)
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    async fn apply_update(&self, current: &ReplicaRecord, update: UpdateFile) -> Result<()> {
        let mut record = current.clone();
        if let Some(version) = update.version {
            record.version = version;
        }
        if let Some(meta) = update.meta {
            record.meta = meta;
        }
        let becoming_deleted =
            update.status == Some(FileStatus::Deleted) && current.status != FileStatus::Deleted;
        if let Some(status) = update.status {
            record.status = status;
        }
        record.date_updated = Some(update.date_updated.unwrap_or_else(Utc::now));
        if update.date_added.is_some() {
            record.date_added = update.date_added;
        }
        if update.date_deleted.is_some() {
            record.date_deleted = update.date_deleted;
        }

        let content = if becoming_deleted {
            self.blobs.delete(&record.id).await?;
            Bytes::new()
        } else if let Some(data) = update.data {
            self.blobs.put(&record.id, data.clone()).await?;
            data
        } else {
            self.blobs.get(&record.id).await?.unwrap_or_default()
        };

        record.refresh_checksums(&content);
        record.locked = false;
        debug!(
            node_id = %self.id,
            file_id = %record.id,
            version = record.version,
            file_crc = record.file_crc,
            "Updated file"
        );
        self.index.write().insert(record.id.clone(), record);
        self.persist().await
    }

    fn correct_checksums(&self, id: &str, file_crc: u32) -> bool {
        let mut index = self.index.write();
        let Some(stored) = index.get_mut(id) else {
            return false;
        };
        if stored.locked {
            return false;
        }
        let meta_crc = meta_checksum(&stored.meta);
        if stored.meta_crc == meta_crc && stored.file_crc == file_crc {
            return false;
        }
        warn!(
            node_id = %self.id,
            file_id = id,
            stored_meta_crc = stored.meta_crc,
            meta_crc,
            stored_file_crc = stored.file_crc,
            file_crc,
            "Corrected stored checksums"
        );
        stored.meta_crc = meta_crc;
        stored.file_crc = file_crc;
        true
    }

    fn lock_record(&self, id: &str) -> Result<ReplicaRecord> {
        let mut index = self.index.write();
        let record = index
            .get_mut(id)
            .ok_or_else(|| Error::FileNotFound(id.to_string()))?;
        record.locked = true;
        Ok(record.clone())
    }

    fn unlock_record(&self, id: &str) {
        if let Some(record) = self.index.write().get_mut(id) {
            record.locked = false;
        }
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(&*self.index.read())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("files", &self.index.read().len())
            .field("index_path", &self.index_path)
            .finish()
    }
}
