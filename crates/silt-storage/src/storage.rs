//! The storage core orchestrator.
//!
//! One [`StreamStorage`] instance owns the WAL device, the log cache,
//! the callback sequencer, the upload pipeline, and the backoff drain
//! task. It is instantiated at process startup and torn down at
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use silt_core::config::StorageConfig;
use silt_core::error::{StorageError, StorageResult};
use silt_core::record::StreamRecord;

use crate::append::{AppendHandle, BackoffQueue, RateLimitedWarn, WriteRequest};
use crate::block_cache::RemoteBlockCache;
use crate::cache::LogCache;
use crate::manager::{ObjectManager, StreamManager};
use crate::object_store::ObjectStore;
use crate::read::{read_merged, ReadDataBlock};
use crate::recovery::recover_and_flush;
use crate::sequencer::CallbackSequencer;
use crate::upload::{UploadPipeline, UploadWaiter};
use crate::wal::{ack_lost, WalDevice};

/// Process-wide delta-WAL storage core.
pub struct StreamStorage {
    config: StorageConfig,
    wal: Arc<dyn WalDevice>,
    cache: Arc<LogCache>,
    sequencer: CallbackSequencer,
    pipeline: Arc<UploadPipeline>,
    remote_cache: Arc<dyn RemoteBlockCache>,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    stream_manager: Arc<dyn StreamManager>,
    backoff: BackoffQueue,
    backpressure_warn: RateLimitedWarn,
    shutdown: AtomicBool,
    drain_stop: watch::Sender<bool>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamStorage {
    /// Wires the storage core together.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidConfig` when `config` fails
    /// validation.
    pub fn new(
        config: StorageConfig,
        wal: Arc<dyn WalDevice>,
        object_store: Arc<dyn ObjectStore>,
        object_manager: Arc<dyn ObjectManager>,
        stream_manager: Arc<dyn StreamManager>,
        remote_cache: Arc<dyn RemoteBlockCache>,
    ) -> StorageResult<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(LogCache::new(config.wal_upload_threshold));
        let pipeline = UploadPipeline::new(
            config.clone(),
            Arc::clone(&object_manager),
            Arc::clone(&object_store),
            Arc::clone(&wal),
            Arc::clone(&cache),
        );
        let (drain_stop, _) = watch::channel(false);
        Ok(Arc::new(Self {
            sequencer: CallbackSequencer::new(config.stream_callback_lock_stripes),
            backpressure_warn: RateLimitedWarn::new(Duration::from_secs(1)),
            config,
            wal,
            cache,
            pipeline,
            remote_cache,
            object_manager,
            object_store,
            stream_manager,
            backoff: BackoffQueue::new(),
            shutdown: AtomicBool::new(false),
            drain_stop,
            drain_handle: Mutex::new(None),
        }))
    }

    /// Starts the WAL device, runs recovery, and launches the backoff
    /// drain task.
    ///
    /// # Errors
    ///
    /// Any error here is fatal to process startup; recovery integrity
    /// violations in particular must not be ignored.
    pub async fn start(self: &Arc<Self>) -> StorageResult<()> {
        self.wal.start().await?;
        recover_and_flush(
            &self.config,
            &self.wal,
            &self.cache,
            &self.object_manager,
            &self.object_store,
            &self.stream_manager,
        )
        .await?;
        self.spawn_drain();
        info!("storage core started");
        Ok(())
    }

    /// Appends a record to its stream.
    ///
    /// The handle resolves once the record is durable in the WAL and
    /// acknowledged in per-stream offset order. Admission failures park
    /// the request in the backoff queue instead of failing it; the drain
    /// task retries until the cache drains or shutdown fails it.
    pub fn append(self: &Arc<Self>, record: StreamRecord) -> AppendHandle {
        let (request, handle) = WriteRequest::new(record);
        if self.shutdown.load(Ordering::Acquire) {
            request.complete(Err(StorageError::Shutdown));
            return handle;
        }
        // Earlier parked appends keep FIFO priority.
        if !self.backoff.is_empty() {
            self.backoff.push(request);
            return handle;
        }
        self.try_append(request, true);
        handle
    }

    /// Admission check: fails closed with `CacheFull` once the cache is
    /// at or above the soft cap.
    fn admit(&self) -> StorageResult<()> {
        let used = self.cache.size();
        if used >= self.config.wal_cache_size {
            return Err(StorageError::CacheFull {
                used,
                cap: self.config.wal_cache_size,
            });
        }
        Ok(())
    }

    /// One admission attempt. Returns false when the request was parked
    /// (or must stay parked) for retry.
    fn try_append(self: &Arc<Self>, request: Arc<WriteRequest>, park_on_failure: bool) -> bool {
        if let Err(error) = self.admit() {
            self.backpressure_warn.warn(|| {
                warn!(
                    error = %error,
                    backlog = self.backoff.len(),
                    "parking append"
                );
            });
            if park_on_failure {
                self.backoff.push(request);
            }
            return false;
        }

        let submitted = self.sequencer.submit(&request, || {
            self.wal.append(request.record().encoded().clone())
        });
        match submitted {
            Ok(wal_handle) => {
                let storage = Arc::clone(self);
                let request = Arc::clone(&request);
                tokio::spawn(async move {
                    match wal_handle.ack.await {
                        Ok(Ok(())) => storage.on_wal_ack(&request),
                        Ok(Err(e)) => request.complete(Err(e)),
                        Err(_) => request.complete(Err(ack_lost())),
                    }
                });
                true
            }
            Err(StorageError::WalOverCapacity) => {
                self.backpressure_warn.warn(|| {
                    warn!("WAL over capacity; forcing flush and parking append");
                });
                // Free WAL space by rolling everything cached into objects.
                self.flush_archived(None);
                if park_on_failure {
                    self.backoff.push(request);
                }
                false
            }
            Err(e) => {
                request.complete(Err(e));
                true
            }
        }
    }

    /// WAL acknowledgement continuation: pop the persisted prefix, insert
    /// it into the cache in offset order, complete the futures, and kick
    /// an upload when the active block crossed the threshold.
    fn on_wal_ack(self: &Arc<Self>, request: &Arc<WriteRequest>) {
        let stream_id = request.stream_id();
        let (popped_any, crossed) = self.sequencer.after_with(request, |popped| {
            let mut crossed = false;
            for req in popped {
                crossed |= self.cache.put(req.record().clone());
                req.complete(Ok(()));
            }
            (!popped.is_empty(), crossed)
        });
        if !popped_any {
            return;
        }
        if let Some(offset) = self.sequencer.wal_confirm_offset() {
            self.cache.set_confirm_offset(offset);
        }
        self.sequencer.try_free(stream_id);
        if crossed {
            self.flush_archived(None);
        }
    }

    /// Archives the active block (when it contains the requested stream)
    /// and queues every archived block oldest-first, re-queueing blocks
    /// whose earlier upload failed.
    fn flush_archived(self: &Arc<Self>, stream_id: Option<u64>) -> Vec<UploadWaiter> {
        self.cache.archive_current_if_contains(stream_id);
        self.cache
            .archived_blocks()
            .into_iter()
            .map(|block| self.pipeline.enqueue(block))
            .collect()
    }

    /// Forces cached data out to remote storage and waits for all
    /// in-flight uploads, the triggered one included.
    ///
    /// # Errors
    ///
    /// Returns the first upload failure; failed blocks remain archived
    /// for the next flush.
    pub async fn force_upload(self: &Arc<Self>, stream_id: Option<u64>) -> StorageResult<()> {
        let waiters = self.flush_archived(stream_id);
        let mut result = Ok(());
        for waiter in waiters {
            let outcome = waiter.wait().await;
            if result.is_ok() {
                result = outcome;
            }
        }
        self.pipeline.wait_idle().await;
        result
    }

    /// Reads `[start_offset, end_offset)` of a stream under `max_bytes`,
    /// merging log-cache and remote-block-cache data.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Integrity` when the merged slice has a gap;
    /// fatal to this request only.
    pub async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: u64,
    ) -> StorageResult<ReadDataBlock> {
        read_merged(
            &self.cache,
            &self.remote_cache,
            stream_id,
            start_offset,
            end_offset,
            max_bytes,
        )
        .await
    }

    /// Synchronous memory-pressure hook: frees oldest archived cache
    /// blocks and returns the bytes actually released. Safe to call from
    /// an allocator callback; it takes only the cache's structural lock.
    pub fn handle_memory_pressure(&self, bytes: u64) -> u64 {
        self.cache.force_free(bytes)
    }

    /// Total bytes currently held by the log cache.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache.size()
    }

    /// Inclusive WAL offset below which every append has been
    /// acknowledged; `None` before the first acknowledgement.
    #[must_use]
    pub fn wal_confirm_offset(&self) -> Option<u64> {
        self.sequencer.wal_confirm_offset()
    }

    /// Number of appends parked for retry.
    #[must_use]
    pub fn backoff_len(&self) -> usize {
        self.backoff.len()
    }

    /// Stops the drain task, fails parked appends, waits out in-flight
    /// uploads, and closes the WAL.
    pub async fn shutdown(self: &Arc<Self>) -> StorageResult<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.drain_stop.send(true);
        let handle = self.drain_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.backoff.fail_all(|| StorageError::Shutdown);
        self.pipeline.wait_idle().await;
        self.wal.shutdown_gracefully().await?;
        info!("storage core shut down");
        Ok(())
    }

    fn spawn_drain(self: &Arc<Self>) {
        let storage = Arc::clone(self);
        let mut stop = self.drain_stop.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                storage.config.backoff_drain_interval_ms,
            ));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => storage.drain_backoff(),
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.drain_handle.lock() = Some(handle);
    }

    /// Retries parked appends through the regular admission path; a
    /// failed retry leaves the request at the head for the next tick.
    fn drain_backoff(self: &Arc<Self>) {
        while let Some(request) = self.backoff.pop() {
            if !self.try_append(Arc::clone(&request), false) {
                self.backoff.push_front(request);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::MemoryBlockCache;
    use crate::manager::{MemoryObjectManager, MemoryStreamManager};
    use crate::object_store::MockObjectStore;
    use crate::wal::MemoryWal;
    use bytes::Bytes;

    struct Fixture {
        storage: Arc<StreamStorage>,
        wal: MemoryWal,
        object_manager: MemoryObjectManager,
        store: MockObjectStore,
        remote: MemoryBlockCache,
    }

    async fn fixture(config: StorageConfig) -> Fixture {
        let wal = MemoryWal::new();
        let object_manager = MemoryObjectManager::new();
        let store = MockObjectStore::new();
        let remote = MemoryBlockCache::new();
        let storage = StreamStorage::new(
            config,
            Arc::new(wal.clone()),
            Arc::new(store.clone()),
            Arc::new(object_manager.clone()),
            Arc::new(MemoryStreamManager::new()),
            Arc::new(remote.clone()),
        )
        .unwrap();
        storage.start().await.unwrap();
        Fixture {
            storage,
            wal,
            object_manager,
            store,
            remote,
        }
    }

    fn record(stream: u64, base: u64, last: u64, body_len: usize) -> StreamRecord {
        StreamRecord::new(stream, base, last, Bytes::from(vec![0u8; body_len])).unwrap()
    }

    #[tokio::test]
    async fn append_completes_and_caches() {
        let f = fixture(StorageConfig::default()).await;
        f.storage
            .append(record(1, 0, 0, 128))
            .wait()
            .await
            .unwrap();

        let block = f.storage.read(1, 0, 1, u64::MAX).await.unwrap();
        assert_eq!(block.records.len(), 1);
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reversed_acks_complete_in_offset_order() {
        let f = fixture(StorageConfig::default()).await;
        f.wal.hold_acks();

        let handles: Vec<AppendHandle> = (0..3u64)
            .map(|base| f.storage.append(record(1, base, base, 64)))
            .collect();
        let pending = f.wal.pending_acks();
        for offset in pending.into_iter().rev() {
            f.wal.ack(offset);
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let block = f.storage.read(1, 0, 3, u64::MAX).await.unwrap();
        let bases: Vec<u64> = block.records.iter().map(|r| r.base_offset()).collect();
        assert_eq!(bases, vec![0, 1, 2]);
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn force_upload_commits_and_frees_cache() {
        let f = fixture(StorageConfig::default()).await;
        f.storage
            .append(record(1, 0, 9, 512))
            .wait()
            .await
            .unwrap();

        f.storage.force_upload(None).await.unwrap();
        assert_eq!(f.storage.cache_size(), 0);
        assert_eq!(f.object_manager.committed_object_ids().len(), 1);
        assert_eq!(f.store.object_count(), 1);
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn memory_pressure_frees_archived_bytes() {
        let f = fixture(StorageConfig::default()).await;
        f.storage
            .append(record(1, 0, 0, 256))
            .wait()
            .await
            .unwrap();

        // Nothing archived yet: nothing to free.
        assert_eq!(f.storage.handle_memory_pressure(1024), 0);

        f.store.hold_puts();
        let waiters = f.storage.flush_archived(None);
        let freed = f.storage.handle_memory_pressure(1);
        assert!(freed > 0);
        assert_eq!(f.storage.cache_size(), 0);
        f.store.release_puts();
        for waiter in waiters {
            let _ = waiter.wait().await;
        }
        f.storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_parked_appends() {
        let config = StorageConfig {
            wal_cache_size: 1024,
            wal_upload_threshold: 1024,
            ..StorageConfig::default()
        };
        let f = fixture(config).await;
        f.store.hold_puts();

        // Fill the cache past the soft cap, then overflow into backoff.
        let first = f.storage.append(record(1, 0, 0, 1200));
        first.wait().await.unwrap();
        let parked = f.storage.append(record(1, 1, 1, 64));
        assert_eq!(f.storage.backoff_len(), 1);

        // Shut down while uploads are still blocked so the parked append
        // cannot sneak through a drain retry first.
        let storage = Arc::clone(&f.storage);
        let shutdown = tokio::spawn(async move { storage.shutdown().await });
        let err = parked.wait().await.unwrap_err();
        assert!(matches!(err, StorageError::Shutdown));

        f.store.release_puts();
        shutdown.await.unwrap().unwrap();
        let _ = f.remote;
    }
}
