//! Silt storage core - delta WAL over S3-compatible object storage
//!
//! This crate implements the write path of a log-structured streaming
//! system: per-stream record appends land in a local write-ahead log for
//! durability, are cached in memory for reads, and asynchronously roll
//! into immutable remote objects.
//!
//! # Architecture
//!
//! ```text
//! append ──► admission ──► WAL ──► sequencer ──► log cache
//!                                                    │ threshold
//!                                                    ▼
//!                                   upload pipeline (prepare ─► commit)
//!                                                    │
//!                                                    ▼
//!                             remote objects + WAL trim + block free
//!
//! read ──► log cache ∪ remote block cache ──► merged contiguous slice
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod append;
pub mod block_cache;
pub mod cache;
pub mod manager;
pub mod object_store;
pub mod read;
pub mod recovery;
pub mod sequencer;
pub mod storage;
pub mod upload;
pub mod wal;

pub use append::{AppendHandle, WriteRequest};
pub use block_cache::{MemoryBlockCache, RemoteBlockCache};
pub use cache::{BlockState, CacheBlock, LogCache};
pub use manager::{
    CommittedUpload, MemoryObjectManager, MemoryStreamManager, ObjectManager, StreamManager,
};
pub use object_store::{
    LocalObjectStore, MockFailure, MockObjectStore, ObjectStore, S3Config, S3ObjectStore,
};
pub use read::{CacheAccess, ReadDataBlock};
pub use recovery::recover_and_flush;
pub use sequencer::CallbackSequencer;
pub use storage::StreamStorage;
pub use upload::{TaskState, UploadPipeline, UploadWaiter};
pub use wal::{FileWal, FileWalConfig, MemoryWal, RecoveredRecord, WalAppendHandle, WalDevice};
