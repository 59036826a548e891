//! In-memory WAL device for tests.
//!
//! Offsets are assigned sequentially; acknowledgements complete inline
//! unless the device is put into held-ack mode, in which case the test
//! releases them explicitly and in any order it likes. Capacity is
//! enforced against untrimmed bytes so backpressure paths can be driven
//! deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use silt_core::error::{StorageError, StorageResult};

use super::{send_ack, RecoveredRecord, WalAppendHandle, WalDevice};

/// In-memory [`WalDevice`] with scriptable acknowledgement order.
#[derive(Clone)]
pub struct MemoryWal {
    inner: Arc<Mutex<State>>,
}

struct State {
    capacity: u64,
    next_offset: u64,
    entries: BTreeMap<u64, Bytes>,
    bytes: u64,
    hold_acks: bool,
    held: Vec<(u64, oneshot::Sender<StorageResult<()>>)>,
    shutdown: bool,
}

impl MemoryWal {
    /// Device with effectively unbounded capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Device that rejects appends once untrimmed bytes exceed `capacity`.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                capacity,
                next_offset: 0,
                entries: BTreeMap::new(),
                bytes: 0,
                hold_acks: false,
                held: Vec::new(),
                shutdown: false,
            })),
        }
    }

    /// Stop acknowledging appends until they are released explicitly.
    pub fn hold_acks(&self) {
        self.inner.lock().hold_acks = true;
    }

    /// Offsets of appends whose acknowledgements are currently held, in
    /// append order.
    #[must_use]
    pub fn pending_acks(&self) -> Vec<u64> {
        self.inner.lock().held.iter().map(|(o, _)| *o).collect()
    }

    /// Release the held acknowledgement for `offset` successfully.
    ///
    /// Unknown offsets are ignored.
    pub fn ack(&self, offset: u64) {
        let entry = {
            let mut state = self.inner.lock();
            state
                .held
                .iter()
                .position(|(o, _)| *o == offset)
                .map(|i| state.held.remove(i))
        };
        if let Some((_, tx)) = entry {
            send_ack(tx, Ok(()));
        }
    }

    /// Release every held acknowledgement in append order and resume
    /// inline acknowledgement.
    pub fn ack_all(&self) {
        let held = {
            let mut state = self.inner.lock();
            state.hold_acks = false;
            std::mem::take(&mut state.held)
        };
        for (_, tx) in held {
            send_ack(tx, Ok(()));
        }
    }

    /// Seed the device with frames as if they had been appended before a
    /// restart. Offsets continue the device's sequence.
    pub fn preload(&self, frames: Vec<Bytes>) {
        let mut state = self.inner.lock();
        for frame in frames {
            let offset = state.next_offset;
            state.next_offset += 1;
            state.bytes += frame.len() as u64;
            state.entries.insert(offset, frame);
        }
    }

    /// Untrimmed bytes currently held.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Highest assigned offset, if any append ever happened.
    #[must_use]
    pub fn last_offset(&self) -> Option<u64> {
        let state = self.inner.lock();
        state.next_offset.checked_sub(1)
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WalDevice for MemoryWal {
    async fn start(&self) -> StorageResult<()> {
        Ok(())
    }

    fn append(&self, data: Bytes) -> StorageResult<WalAppendHandle> {
        let (tx, rx) = oneshot::channel();
        let offset = {
            let mut state = self.inner.lock();
            if state.shutdown {
                return Err(StorageError::Shutdown);
            }
            if state.bytes + data.len() as u64 > state.capacity {
                return Err(StorageError::WalOverCapacity);
            }
            let offset = state.next_offset;
            state.next_offset += 1;
            state.bytes += data.len() as u64;
            state.entries.insert(offset, data);
            if state.hold_acks {
                state.held.push((offset, tx));
                return Ok(WalAppendHandle { offset, ack: rx });
            }
            offset
        };
        send_ack(tx, Ok(()));
        Ok(WalAppendHandle { offset, ack: rx })
    }

    async fn recover(&self) -> StorageResult<Vec<RecoveredRecord>> {
        let state = self.inner.lock();
        Ok(state
            .entries
            .iter()
            .map(|(offset, data)| RecoveredRecord {
                offset: *offset,
                data: data.clone(),
            })
            .collect())
    }

    async fn reset(&self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.bytes = 0;
        Ok(())
    }

    fn trim(&self, offset: u64) {
        let mut state = self.inner.lock();
        let keep = state.entries.split_off(&(offset + 1));
        let dropped = std::mem::replace(&mut state.entries, keep);
        for data in dropped.values() {
            state.bytes -= data.len() as u64;
        }
    }

    async fn shutdown_gracefully(&self) -> StorageResult<()> {
        let held = {
            let mut state = self.inner.lock();
            state.shutdown = true;
            std::mem::take(&mut state.held)
        };
        // Outstanding appends are already in memory; flush them as durable.
        for (_, tx) in held {
            send_ack(tx, Ok(()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assigns_sequential_offsets_and_acks_inline() {
        let wal = MemoryWal::new();
        let a = wal.append(Bytes::from_static(b"a")).unwrap();
        let b = wal.append(Bytes::from_static(b"b")).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1);
        a.ack.await.unwrap().unwrap();
        b.ack.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn held_acks_release_in_any_order() {
        let wal = MemoryWal::new();
        wal.hold_acks();

        let a = wal.append(Bytes::from_static(b"a")).unwrap();
        let b = wal.append(Bytes::from_static(b"b")).unwrap();
        assert_eq!(wal.pending_acks(), vec![0, 1]);

        wal.ack(b.offset);
        b.ack.await.unwrap().unwrap();
        wal.ack(a.offset);
        a.ack.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn enforces_capacity_until_trim() {
        let wal = MemoryWal::with_capacity(4);
        wal.append(Bytes::from_static(b"abcd")).unwrap();

        let err = wal.append(Bytes::from_static(b"e")).unwrap_err();
        assert!(matches!(err, StorageError::WalOverCapacity));

        wal.trim(0);
        assert_eq!(wal.size(), 0);
        wal.append(Bytes::from_static(b"e")).unwrap();
    }

    #[tokio::test]
    async fn recover_returns_untrimmed_entries_in_order() {
        let wal = MemoryWal::new();
        for body in [b"a", b"b", b"c"] {
            wal.append(Bytes::from_static(body)).unwrap();
        }
        wal.trim(0);

        let recovered = wal.recover().await.unwrap();
        let offsets: Vec<u64> = recovered.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn rejects_appends_after_shutdown() {
        let wal = MemoryWal::new();
        wal.shutdown_gracefully().await.unwrap();
        let err = wal.append(Bytes::from_static(b"a")).unwrap_err();
        assert!(matches!(err, StorageError::Shutdown));
    }
}
