//! Write-ahead log device contract.
//!
//! The device serializes its own offsets: `append` assigns a strictly
//! increasing offset synchronously, while durability is signalled later
//! through the handle's acknowledgement channel, possibly out of order
//! across callers. Per-stream reordering of those acknowledgements is the
//! sequencer's job, not the device's.

mod file;
mod memory;

pub use file::{FileWal, FileWalConfig};
pub use memory::MemoryWal;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use silt_core::error::{StorageError, StorageResult};

/// Outcome of submitting one append to the device.
#[derive(Debug)]
pub struct WalAppendHandle {
    /// Offset the device assigned to the record.
    pub offset: u64,
    /// Resolves once the record is durable. A dropped sender means the
    /// device went away before persisting the record.
    pub ack: oneshot::Receiver<StorageResult<()>>,
}

/// One record read back during recovery.
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    /// Offset the device assigned at append time.
    pub offset: u64,
    /// The record frame exactly as appended.
    pub data: Bytes,
}

/// Write-ahead log device.
///
/// Implementations must be safe for concurrent appends and provide total
/// offset ordering internally. Over-capacity is reported as the
/// distinguished [`StorageError::WalOverCapacity`] so the caller can
/// force-flush and back off instead of failing the request.
#[async_trait]
pub trait WalDevice: Send + Sync {
    /// Brings the device online. Must be called before the first append.
    async fn start(&self) -> StorageResult<()>;

    /// Submits a record, returning its assigned offset immediately.
    ///
    /// Durability is signalled through the returned handle.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::WalOverCapacity` when the device has no free
    /// capacity, and `StorageError::Shutdown` after graceful shutdown.
    fn append(&self, data: Bytes) -> StorageResult<WalAppendHandle>;

    /// Reads back every untrimmed record, in offset order.
    async fn recover(&self) -> StorageResult<Vec<RecoveredRecord>>;

    /// Discards all contents and resets the offset sequence.
    async fn reset(&self) -> StorageResult<()>;

    /// Discards records up to and including `offset`. Never moves
    /// backwards; a stale offset is a no-op.
    fn trim(&self, offset: u64);

    /// Flushes outstanding appends and takes the device offline.
    async fn shutdown_gracefully(&self) -> StorageResult<()>;
}

/// Completes an acknowledgement channel, ignoring a receiver that has
/// already gone away.
pub(crate) fn send_ack(tx: oneshot::Sender<StorageResult<()>>, result: StorageResult<()>) {
    let _ = tx.send(result);
}

/// Maps a closed acknowledgement channel onto a storage error.
pub(crate) fn ack_lost() -> StorageError {
    StorageError::storage("WAL device dropped the acknowledgement channel")
}
