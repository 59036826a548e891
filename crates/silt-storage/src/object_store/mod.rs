//! Object store abstraction for S3-compatible storage.
//!
//! Committed cache blocks become immutable objects; the read path fetches
//! byte ranges of them when the log cache no longer holds the head of a
//! requested slice. Backends: AWS S3 / MinIO for production, the local
//! filesystem for development, and an in-memory mock with failure
//! injection for tests.

mod local;
mod mock;
mod s3;

pub use local::LocalObjectStore;
pub use mock::{MockFailure, MockObjectStore};
pub use s3::{S3Config, S3ObjectStore};

use async_trait::async_trait;
use bytes::Bytes;

use silt_core::error::StorageResult;

/// S3-like object store.
///
/// Implementations must be `Send + Sync` and safe for concurrent use.
/// Keys are opaque UTF-8 strings; the upload pipeline derives them from
/// object ids via [`silt_core::object::object_key`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes a complete object. Overwrites silently.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Storage` when the backend rejects the write.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Reads a complete object.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ObjectNotFound` when the key does not exist.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Reads `[start, end)` of an object.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ObjectNotFound` when the key does not exist
    /// and `StorageError::Storage` when the range is not satisfiable.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Whether the object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Deletes the object. Deleting a missing object is a no-op.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}
