//! Local filesystem implementation of [`ObjectStore`].
//!
//! Objects are plain files under a base directory, keyed by relative
//! path. Useful for development and for running the storage core without
//! an S3 endpoint.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use silt_core::error::{StorageError, StorageResult};

use super::ObjectStore;

/// Directory-backed object store.
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    /// Creates the store, creating `base_dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` when directory creation fails.
    pub async fn new(base_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn map_not_found(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::ObjectNotFound {
                key: key.to_string(),
            }
        } else {
            StorageError::from(e)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::storage("object key cannot be empty"));
        }
        let path = self.full_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.full_path(key);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let data = self.get(key).await?;
        let len = data.len() as u64;
        if start > end || end > len {
            return Err(StorageError::storage(format!(
                "range [{}, {}) not satisfiable for object `{}` of {} bytes",
                start, end, key, len
            )));
        }
        Ok(data.slice(start as usize..end as usize))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(tokio::fs::try_exists(self.full_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
