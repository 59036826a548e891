//! Configuration for the delta-WAL storage core.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Storage core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Soft cap on total log cache bytes; admission fails closed above it.
    pub wal_cache_size: u64,
    /// Active-block size that triggers an upload.
    pub wal_upload_threshold: u64,
    /// Per-stream byte count inside a block that forces a dedicated
    /// stream object during upload planning.
    pub stream_split_size: u64,
    /// Maximum number of streams aggregated into one stream-set object.
    pub max_stream_num_per_stream_set_object: usize,
    /// Concurrency cap for object-store writes.
    pub upload_io_pool_size: usize,
    /// Cadence of the backoff-queue drain task, in milliseconds.
    pub backoff_drain_interval_ms: u64,
    /// Number of lock stripes serializing per-stream callbacks.
    pub stream_callback_lock_stripes: usize,
    /// TTL handed to the object manager when reserving object ids.
    pub object_prepare_ttl_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_cache_size: 1024 * 1024 * 1024,      // 1 GiB
            wal_upload_threshold: 512 * 1024 * 1024, // 512 MiB
            stream_split_size: 16 * 1024 * 1024,     // 16 MiB
            max_stream_num_per_stream_set_object: 10_000,
            upload_io_pool_size: 4,
            backoff_drain_interval_ms: 100,
            stream_callback_lock_stripes: 128,
            object_prepare_ttl_ms: 30_000,
        }
    }
}

impl StorageConfig {
    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidConfig` naming the offending option.
    pub fn validate(&self) -> StorageResult<()> {
        if self.wal_cache_size == 0 {
            return Err(self.invalid("wal_cache_size must be > 0"));
        }
        if self.wal_upload_threshold == 0 {
            return Err(self.invalid("wal_upload_threshold must be > 0"));
        }
        if self.wal_upload_threshold > self.wal_cache_size {
            return Err(self.invalid("wal_upload_threshold must not exceed wal_cache_size"));
        }
        if self.stream_split_size == 0 {
            return Err(self.invalid("stream_split_size must be > 0"));
        }
        if self.max_stream_num_per_stream_set_object == 0 {
            return Err(self.invalid("max_stream_num_per_stream_set_object must be > 0"));
        }
        if self.upload_io_pool_size == 0 {
            return Err(self.invalid("upload_io_pool_size must be > 0"));
        }
        if self.backoff_drain_interval_ms == 0 {
            return Err(self.invalid("backoff_drain_interval_ms must be > 0"));
        }
        if self.stream_callback_lock_stripes == 0 {
            return Err(self.invalid("stream_callback_lock_stripes must be > 0"));
        }
        Ok(())
    }

    fn invalid(&self, message: &str) -> StorageError {
        StorageError::InvalidConfig {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StorageConfig::default();
        assert_eq!(config.upload_io_pool_size, 4);
        assert_eq!(config.backoff_drain_interval_ms, 100);
        assert_eq!(config.stream_callback_lock_stripes, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_threshold_above_cache_size() {
        let config = StorageConfig {
            wal_cache_size: 1024,
            wal_upload_threshold: 2048,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_stripes() {
        let config = StorageConfig {
            stream_callback_lock_stripes: 0,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
