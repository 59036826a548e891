//! AWS S3 implementation of [`ObjectStore`].
//!
//! Works against standard AWS S3 and S3-compatible endpoints (MinIO,
//! Wasabi, etc.). Range reads use the HTTP `Range` header so the read
//! path never pulls a whole object for a small slice.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client, Config};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use silt_core::error::{StorageError, StorageResult};

use super::ObjectStore;

/// S3 connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// AWS region (e.g. "us-west-2").
    pub region: String,
    /// Custom endpoint URL for S3-compatible stores
    /// (e.g. MinIO: "http://localhost:9000").
    pub endpoint: Option<String>,
    /// Static access key for custom endpoints.
    pub access_key: Option<String>,
    /// Static secret key for custom endpoints.
    pub secret_key: Option<String>,
}

impl S3Config {
    /// Config for standard AWS S3 using ambient IAM credentials.
    pub fn aws(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        }
    }

    /// Config for MinIO or another custom S3-compatible endpoint.
    pub fn custom(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: Some(endpoint.into()),
            access_key: Some(access_key.into()),
            secret_key: Some(secret_key.into()),
        }
    }
}

/// AWS S3 object store.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Connects using `config`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Storage` when SDK initialization fails.
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        let client = if let (Some(endpoint), Some(access), Some(secret)) =
            (&config.endpoint, &config.access_key, &config.secret_key)
        {
            let creds = Credentials::new(access, secret, None, None, "silt-static");
            let s3_config = Config::builder()
                .endpoint_url(endpoint)
                .credentials_provider(creds)
                .region(aws_sdk_s3::config::Region::new(config.region.clone()))
                .force_path_style(true) // Required for MinIO
                .behavior_version(BehaviorVersion::latest())
                .build();
            Client::from_conf(s3_config)
        } else {
            let aws_config = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()))
                .load()
                .await;
            Client::new(&aws_config)
        };

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    fn map_get_error(key: &str, e: impl std::fmt::Display) -> StorageError {
        let message = e.to_string();
        if message.contains("NoSuchKey") || message.contains("404") {
            StorageError::ObjectNotFound {
                key: key.to_string(),
            }
        } else {
            StorageError::storage(format!("S3 get failed: {}", message))
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::storage("object key cannot be empty"));
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::storage(format!("S3 put failed: {}", e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_get_error(key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::storage(format!("S3 read failed: {}", e)))?
            .into_bytes();
        Ok(data)
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        if start >= end {
            return Ok(Bytes::new());
        }
        // HTTP ranges are inclusive on both ends.
        let range = format!("bytes={}-{}", start, end - 1);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| Self::map_get_error(key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::storage(format!("S3 range read failed: {}", e)))?
            .into_bytes();
        Ok(data)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("NotFound") || message.contains("404") {
                    Ok(false)
                } else {
                    Err(StorageError::storage(format!("S3 head failed: {}", e)))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::storage(format!("S3 delete failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_config_uses_ambient_credentials() {
        let config = S3Config::aws("silt-data", "us-west-2");
        assert_eq!(config.bucket, "silt-data");
        assert_eq!(config.region, "us-west-2");
        assert!(config.endpoint.is_none());
        assert!(config.access_key.is_none());
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn custom_config_carries_endpoint_and_static_credentials() {
        let config = S3Config::custom(
            "silt-data",
            "us-east-1",
            "http://localhost:9000",
            "minioadmin",
            "minioadmin",
        );
        assert_eq!(config.bucket, "silt-data");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.access_key.as_deref(), Some("minioadmin"));
        assert_eq!(config.secret_key.as_deref(), Some("minioadmin"));
    }

    #[test]
    fn missing_key_errors_map_to_not_found() {
        let err = S3ObjectStore::map_get_error(
            "objects/0000000000000001",
            "NoSuchKey: the specified key does not exist",
        );
        assert!(matches!(
            err,
            StorageError::ObjectNotFound { key } if key == "objects/0000000000000001"
        ));

        let err = S3ObjectStore::map_get_error("objects/0000000000000002", "http status: 404");
        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }

    #[test]
    fn other_get_errors_stay_storage_errors() {
        let err = S3ObjectStore::map_get_error("objects/0000000000000001", "503 Service Unavailable");
        assert!(matches!(err, StorageError::Storage { .. }));
    }
}
