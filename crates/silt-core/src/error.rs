use thiserror::Error;

/// Canonical error type for storage-core operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Log cache is at or above its soft cap; the request must back off.
    #[error("log cache full: {used} bytes used, soft cap {cap}")]
    CacheFull {
        /// Bytes currently held by the cache.
        used: u64,
        /// Configured soft cap in bytes.
        cap: u64,
    },

    /// WAL device rejected an append because it has no free capacity.
    #[error("WAL over capacity")]
    WalOverCapacity,

    /// Data failed an ordering or contiguity check.
    #[error("integrity violation: {message}")]
    Integrity {
        /// Human-readable description of the violated invariant.
        message: String,
    },

    /// Object prepare or upload failed; the source block stays archived
    /// and the next flush retries it.
    #[error("upload failed: {message}")]
    Upload {
        /// Human-readable failure details.
        message: String,
    },

    /// Object does not exist in the object store.
    #[error("object `{key}` was not found")]
    ObjectNotFound {
        /// Key of the missing object.
        key: String,
    },

    /// Object commit failed after the objects were already published.
    #[error("commit failed: {message}")]
    Commit {
        /// Human-readable failure details.
        message: String,
    },

    /// The storage core is shutting down; queued work is abandoned.
    #[error("storage is shutting down")]
    Shutdown,

    /// I/O error from the WAL device or local object store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record frame could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Human-readable failure details.
        message: String,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Human-readable description of the invalid option.
        message: String,
    },

    /// Storage backend error (network, permissions, metadata service).
    #[error("storage error: {message}")]
    Storage {
        /// Human-readable failure details.
        message: String,
    },
}

impl StorageError {
    /// Creates an `Integrity` variant.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Creates an `Upload` variant.
    #[must_use]
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
        }
    }

    /// Creates a `Commit` variant.
    #[must_use]
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }

    /// Creates a `Codec` variant.
    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a `Storage` variant.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether the error is transient and the operation may be retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::CacheFull { .. } | Self::WalOverCapacity | Self::Upload { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}

/// Convenient result alias for storage-core operations.
pub type StorageResult<T> = Result<T, StorageError>;
