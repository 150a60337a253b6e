//! Raw content storage

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tern_proto::content_checksum;
use tracing::debug;

use crate::error::{Error, Result};

/// Byte storage keyed by file id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `id`, replacing any previous content
    async fn put(&self, id: &str, data: Bytes) -> Result<()>;

    /// Fetch content; `None` when nothing is stored
    async fn get(&self, id: &str) -> Result<Option<Bytes>>;

    /// Drop content. Deleting a missing blob is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// CRC-32 of stored content; a missing blob hashes as empty content
    async fn checksum(&self, id: &str) -> Result<u32> {
        let data = self.get(id).await?.unwrap_or_default();
        Ok(content_checksum(&data))
    }
}

/// In-memory blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<()> {
        self.blobs.insert(id.to_string(), data);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.blobs.remove(id);
        Ok(())
    }
}

/// Filesystem blob store, one file per id under a root directory
#[derive(Debug)]
pub struct FsBlobStore {
    /// Root storage path
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        debug!(root = %root.display(), "Initializing filesystem blob store");

        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.starts_with('.')
        {
            return Err(Error::InvalidInput(format!("unusable file id: {id:?}")));
        }
        Ok(self.root.join(id))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<()> {
        let path = self.blob_path(id)?;
        let tmp = self.root.join(format!(".{id}.tmp"));

        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(file_id = id, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Bytes>> {
        let path = self.blob_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.blob_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(file_id = id, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let store = MemoryBlobStore::new();
        store.put("f1", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.get("f1").await.unwrap().unwrap(), "abc");
        assert_eq!(store.len(), 1);

        store.delete("f1").await.unwrap();
        assert!(store.get("f1").await.unwrap().is_none());
        store.delete("f1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_blob_checksums_as_empty() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.checksum("nope").await.unwrap(), content_checksum(&[]));
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs")).await.unwrap();

        store.put("f1", Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(store.get("f1").await.unwrap().unwrap(), "payload");
        assert_eq!(
            store.checksum("f1").await.unwrap(),
            content_checksum(b"payload")
        );
        assert!(!dir.path().join("blobs").join(".f1.tmp").exists());

        store.delete("f1").await.unwrap();
        assert!(store.get("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_ids() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let err = store.put("../escape", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
