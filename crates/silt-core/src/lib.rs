//! Core domain types for the Silt delta-WAL storage engine.

pub mod config;
pub mod error;
pub mod object;
pub mod record;
pub mod stream;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use object::{ObjectManifest, ObjectStreamRange, StreamObjectManifest};
pub use record::StreamRecord;
pub use stream::StreamMetadata;
