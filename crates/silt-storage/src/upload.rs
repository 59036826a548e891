//! Ordered prepare→commit upload pipeline.
//!
//! Archived cache blocks become remote objects through two serial
//! stages. At most one prepare and one commit run at a time, but prepare
//! of task N+1 overlaps commit of task N. Object ids are reserved during
//! prepare and tasks commit in enqueue order, so earlier cache blocks
//! always become earlier objects with smaller ids.
//!
//! A prepare or upload failure fails the task and everything queued
//! behind it; the blocks stay ARCHIVED and the next flush re-enqueues
//! them oldest-first with fresh ids. A commit failure after the objects
//! were published aborts the process: downstream consumers have already
//! been promised a monotone object sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use silt_core::config::StorageConfig;
use silt_core::error::{StorageError, StorageResult};
use silt_core::object::{object_key, ObjectManifest, ObjectStreamRange, StreamObjectManifest};
use silt_core::record::StreamRecord;

use crate::cache::{CacheBlock, LogCache};
use crate::manager::ObjectManager;
use crate::object_store::ObjectStore;
use crate::wal::WalDevice;

/// Lifecycle of one upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Prepared,
    Uploading,
    Committed,
    Failed,
}

/// Per-stream partition of a block: streams promoted to dedicated stream
/// objects and streams aggregated into the stream-set object.
struct ObjectPlan {
    stream_set: Vec<(u64, Vec<StreamRecord>)>,
    split: Vec<(u64, Vec<StreamRecord>)>,
}

/// Partitions a block's records. A stream leaves the stream-set object
/// when its byte count exceeds `split_size`, or when the set would
/// otherwise aggregate more than `max_set_streams` streams (largest
/// leave first).
fn plan_block(block: &CacheBlock, split_size: u64, max_set_streams: usize) -> ObjectPlan {
    let mut stream_set = Vec::new();
    let mut split = Vec::new();
    for stream_id in block.stream_ids() {
        let records = block.records()[&stream_id].clone();
        let bytes: u64 = records.iter().map(|r| r.size() as u64).sum();
        if bytes > split_size {
            split.push((stream_id, records));
        } else {
            stream_set.push((stream_id, records));
        }
    }
    while stream_set.len() > max_set_streams {
        let (largest, _) = stream_set
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, records))| {
                records.iter().map(|r| r.size() as u64).sum::<u64>()
            })
            .expect("stream_set is non-empty");
        let promoted = stream_set.remove(largest);
        split.push(promoted);
    }
    split.sort_by_key(|(stream_id, _)| *stream_id);
    ObjectPlan { stream_set, split }
}

/// Manifests plus payloads ready for the object store.
struct PlannedObjects {
    manifest: Option<ObjectManifest>,
    stream_objects: Vec<StreamObjectManifest>,
    payloads: Vec<(String, Bytes)>,
}

/// Lays out the planned objects, assigning ids from `first_id`: the
/// stream-set object first, then stream objects in stream order.
fn build_objects(plan: &ObjectPlan, first_id: u64) -> PlannedObjects {
    let mut payloads = Vec::new();
    let mut next_id = first_id;

    let manifest = if plan.stream_set.is_empty() {
        None
    } else {
        let object_id = next_id;
        next_id += 1;
        let mut ranges = Vec::with_capacity(plan.stream_set.len());
        let mut body = BytesMut::new();
        for (stream_id, records) in &plan.stream_set {
            let data_offset = body.len() as u64;
            for record in records {
                body.extend_from_slice(record.encoded());
            }
            ranges.push(ObjectStreamRange {
                stream_id: *stream_id,
                start_offset: records[0].base_offset(),
                end_offset: records[records.len() - 1].end_offset(),
                data_offset,
                data_size: body.len() as u64 - data_offset,
            });
        }
        let body = body.freeze();
        payloads.push((object_key(object_id), body.clone()));
        Some(ObjectManifest {
            object_id,
            size: body.len() as u64,
            streams: ranges,
            committed_at: Utc::now(),
        })
    };

    let mut stream_objects = Vec::with_capacity(plan.split.len());
    for (stream_id, records) in &plan.split {
        let object_id = next_id;
        next_id += 1;
        let mut body = BytesMut::new();
        for record in records {
            body.extend_from_slice(record.encoded());
        }
        let body = body.freeze();
        stream_objects.push(StreamObjectManifest {
            object_id,
            stream_id: *stream_id,
            start_offset: records[0].base_offset(),
            end_offset: records[records.len() - 1].end_offset(),
            size: body.len() as u64,
            committed_at: Utc::now(),
        });
        payloads.push((object_key(object_id), body));
    }

    PlannedObjects {
        manifest,
        stream_objects,
        payloads,
    }
}

type DoneResult = Result<(), String>;

/// Completion fan-out: a task can be awaited by several callers.
#[derive(Default)]
struct TaskDone {
    inner: Mutex<(Option<DoneResult>, Vec<tokio::sync::oneshot::Sender<DoneResult>>)>,
}

impl TaskDone {
    fn subscribe(&self) -> tokio::sync::oneshot::Receiver<DoneResult> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut inner = self.inner.lock();
        if let Some(result) = &inner.0 {
            let _ = tx.send(result.clone());
        } else {
            inner.1.push(tx);
        }
        rx
    }

    fn complete(&self, result: DoneResult) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.0.is_some() {
                return;
            }
            inner.0 = Some(result.clone());
            std::mem::take(&mut inner.1)
        };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }
}

/// One archived block moving through the pipeline.
pub struct UploadTask {
    task_id: Uuid,
    block: Arc<CacheBlock>,
    state: Mutex<TaskState>,
    prepared: Mutex<Option<(Option<ObjectManifest>, Vec<StreamObjectManifest>)>>,
    uploads: Mutex<Vec<JoinHandle<StorageResult<()>>>>,
    done: TaskDone,
}

impl UploadTask {
    fn new(block: Arc<CacheBlock>) -> Arc<Self> {
        Arc::new(Self {
            task_id: Uuid::new_v4(),
            block,
            state: Mutex::new(TaskState::Created),
            prepared: Mutex::new(None),
            uploads: Mutex::new(Vec::new()),
            done: TaskDone::default(),
        })
    }

    /// Current pipeline state of the task.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }
}

/// Handle a caller awaits for one enqueued block.
pub struct UploadWaiter {
    rx: tokio::sync::oneshot::Receiver<DoneResult>,
}

impl UploadWaiter {
    /// Waits for the block's upload to commit or fail.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Upload` when the task failed.
    pub async fn wait(self) -> StorageResult<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StorageError::upload(message)),
            Err(_) => Err(StorageError::Shutdown),
        }
    }
}

struct PipelineState {
    prepare_queue: VecDeque<Arc<UploadTask>>,
    commit_queue: VecDeque<Arc<UploadTask>>,
    preparing: bool,
    committing: bool,
    tracked: HashMap<u64, Arc<UploadTask>>,
    /// Block seq of a task that failed while a later prepare was still in
    /// flight; that prepare must fail too instead of committing out of
    /// block order.
    poison_barrier: Option<u64>,
}

/// The upload pipeline.
pub struct UploadPipeline {
    config: StorageConfig,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    wal: Arc<dyn WalDevice>,
    cache: Arc<LogCache>,
    io_permits: Arc<Semaphore>,
    state: Mutex<PipelineState>,
    inflight_tx: watch::Sender<usize>,
    inflight_rx: watch::Receiver<usize>,
}

impl UploadPipeline {
    pub fn new(
        config: StorageConfig,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        wal: Arc<dyn WalDevice>,
        cache: Arc<LogCache>,
    ) -> Arc<Self> {
        let (inflight_tx, inflight_rx) = watch::channel(0);
        Arc::new(Self {
            io_permits: Arc::new(Semaphore::new(config.upload_io_pool_size)),
            config,
            object_manager,
            object_store,
            wal,
            cache,
            state: Mutex::new(PipelineState {
                prepare_queue: VecDeque::new(),
                commit_queue: VecDeque::new(),
                preparing: false,
                committing: false,
                tracked: HashMap::new(),
                poison_barrier: None,
            }),
            inflight_tx,
            inflight_rx,
        })
    }

    /// Queues an archived block for upload. Re-queueing a block already in
    /// flight returns a waiter on the existing task.
    pub fn enqueue(self: &Arc<Self>, block: Arc<CacheBlock>) -> UploadWaiter {
        let (waiter, start) = {
            let mut state = self.state.lock();
            if let Some(task) = state.tracked.get(&block.seq()) {
                (
                    UploadWaiter {
                        rx: task.done.subscribe(),
                    },
                    false,
                )
            } else {
                let task = UploadTask::new(Arc::clone(&block));
                let waiter = UploadWaiter {
                    rx: task.done.subscribe(),
                };
                state.tracked.insert(block.seq(), Arc::clone(&task));
                state.prepare_queue.push_back(task);
                self.inflight_tx.send_modify(|n| *n += 1);
                (waiter, true)
            }
        };
        if start {
            self.maybe_start_prepare();
        }
        waiter
    }

    /// Suspends until no task is queued or in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.inflight_rx.clone();
        while *rx.borrow() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of tasks queued or in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        *self.inflight_rx.borrow()
    }

    fn maybe_start_prepare(self: &Arc<Self>) {
        let task = {
            let mut state = self.state.lock();
            if state.preparing {
                return;
            }
            let Some(task) = state.prepare_queue.pop_front() else {
                return;
            };
            state.preparing = true;
            task
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let result = pipeline.prepare(&task).await;
            let poisoned = {
                let mut state = pipeline.state.lock();
                state.preparing = false;
                state.poison_barrier.take().is_some()
            };
            if poisoned {
                // An earlier block failed while this prepare was in
                // flight; committing it would break block order.
                *task.state.lock() = TaskState::Failed;
                for upload in task.uploads.lock().drain(..) {
                    upload.abort();
                }
                pipeline.finish(&task, Err("earlier cache block failed to upload".to_string()));
            } else {
                match result {
                    Ok(()) => {
                        *task.state.lock() = TaskState::Prepared;
                        pipeline.state.lock().commit_queue.push_back(task);
                        pipeline.maybe_start_commit();
                    }
                    Err(e) => {
                        debug!(task_id = %task.task_id, error = %e, "upload prepare failed");
                        pipeline.fail_from(&task, &e);
                    }
                }
            }
            pipeline.maybe_start_prepare();
        });
    }

    /// Reserves object ids, lays out payloads, and starts the part
    /// uploads. Completion means all bytes are in flight, not committed.
    async fn prepare(&self, task: &Arc<UploadTask>) -> StorageResult<()> {
        let plan = plan_block(
            &task.block,
            self.config.stream_split_size,
            self.config.max_stream_num_per_stream_set_object,
        );
        let count = usize::from(!plan.stream_set.is_empty()) + plan.split.len();
        let first_id = self
            .object_manager
            .prepare(count, self.config.object_prepare_ttl_ms)
            .await?;
        let objects = build_objects(&plan, first_id);

        debug!(
            task_id = %task.task_id,
            block_seq = task.block.seq(),
            first_object_id = first_id,
            objects = count,
            "prepared upload task"
        );

        let mut uploads = task.uploads.lock();
        for (key, body) in objects.payloads {
            let store = Arc::clone(&self.object_store);
            let permits = Arc::clone(&self.io_permits);
            uploads.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| StorageError::Shutdown)?;
                store.put(&key, body).await
            }));
        }
        *task.prepared.lock() = Some((objects.manifest, objects.stream_objects));
        Ok(())
    }

    fn maybe_start_commit(self: &Arc<Self>) {
        let task = {
            let mut state = self.state.lock();
            if state.committing {
                return;
            }
            let Some(task) = state.commit_queue.pop_front() else {
                return;
            };
            state.committing = true;
            task
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            *task.state.lock() = TaskState::Uploading;
            let result = pipeline.upload_and_commit(&task).await;
            {
                let mut state = pipeline.state.lock();
                state.committing = false;
            }
            match result {
                Ok(()) => {
                    *task.state.lock() = TaskState::Committed;
                    pipeline.finish(&task, Ok(()));
                }
                Err(e) => {
                    debug!(task_id = %task.task_id, error = %e, "upload failed before commit");
                    pipeline.fail_from(&task, &e);
                }
            }
            pipeline.maybe_start_commit();
        });
    }

    /// Awaits the part uploads, then publishes, trims the WAL, and frees
    /// the block.
    async fn upload_and_commit(&self, task: &Arc<UploadTask>) -> StorageResult<()> {
        let uploads: Vec<JoinHandle<StorageResult<()>>> =
            std::mem::take(&mut *task.uploads.lock());
        for upload in uploads {
            upload
                .await
                .map_err(|e| StorageError::upload(format!("upload task panicked: {}", e)))??;
        }

        let (manifest, stream_objects) = task
            .prepared
            .lock()
            .take()
            .ok_or_else(|| StorageError::upload("task reached commit without a prepared plan"))?;

        // Objects are now fully written. Any error past this point leaves
        // metadata and data inconsistent, which downstream consumers
        // cannot reason about.
        let commit = match manifest {
            Some(mut manifest) => {
                manifest.committed_at = Utc::now();
                self.object_manager
                    .commit_stream_set_object(manifest, stream_objects, Vec::new())
                    .await
            }
            None => {
                let mut result = Ok(());
                for mut stream_object in stream_objects {
                    stream_object.committed_at = Utc::now();
                    result = self
                        .object_manager
                        .commit_stream_object(stream_object, Vec::new())
                        .await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
        };
        if let Err(e) = commit {
            error!(
                task_id = %task.task_id,
                block_seq = task.block.seq(),
                error = %e,
                "object commit failed after publication; aborting"
            );
            std::process::abort();
        }

        if let Some(confirm_offset) = task.block.confirm_offset() {
            self.wal.trim(confirm_offset);
        }
        self.cache.mark_free(&task.block);
        info!(
            task_id = %task.task_id,
            block_seq = task.block.seq(),
            size = task.block.size(),
            "committed upload task"
        );
        Ok(())
    }

    /// Fails `task` and every task queued behind it (later block seq).
    /// Earlier tasks already prepared keep committing. All failed blocks
    /// stay archived; the next flush re-enqueues them oldest-first.
    fn fail_from(&self, task: &Arc<UploadTask>, error: &StorageError) {
        let barrier = task.block.seq();
        let mut failed = vec![Arc::clone(task)];
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            for queue in [&mut state.commit_queue, &mut state.prepare_queue] {
                let mut kept = VecDeque::with_capacity(queue.len());
                for queued in queue.drain(..) {
                    if queued.block.seq() > barrier {
                        failed.push(queued);
                    } else {
                        kept.push_back(queued);
                    }
                }
                *queue = kept;
            }
            if state.preparing {
                state.poison_barrier = Some(barrier);
            }
        }
        let message = error.to_string();
        for task in failed {
            *task.state.lock() = TaskState::Failed;
            for upload in task.uploads.lock().drain(..) {
                upload.abort();
            }
            self.finish(&task, Err(message.clone()));
        }
    }

    fn finish(&self, task: &Arc<UploadTask>, result: DoneResult) {
        {
            let mut state = self.state.lock();
            state.tracked.remove(&task.block.seq());
        }
        task.done.complete(result);
        self.inflight_tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One-shot prepare→upload→commit used by recovery, before the pipeline
/// exists. Runs the same planner and layout as the pipeline.
pub async fn upload_block_once(
    config: &StorageConfig,
    object_manager: &Arc<dyn ObjectManager>,
    object_store: &Arc<dyn ObjectStore>,
    block: &Arc<CacheBlock>,
) -> StorageResult<()> {
    let plan = plan_block(
        block,
        config.stream_split_size,
        config.max_stream_num_per_stream_set_object,
    );
    let count = usize::from(!plan.stream_set.is_empty()) + plan.split.len();
    if count == 0 {
        return Ok(());
    }
    let first_id = object_manager
        .prepare(count, config.object_prepare_ttl_ms)
        .await?;
    let objects = build_objects(&plan, first_id);
    for (key, body) in objects.payloads {
        object_store.put(&key, body).await?;
    }
    match objects.manifest {
        Some(manifest) => {
            object_manager
                .commit_stream_set_object(manifest, objects.stream_objects, Vec::new())
                .await?;
        }
        None => {
            for stream_object in objects.stream_objects {
                object_manager
                    .commit_stream_object(stream_object, Vec::new())
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryObjectManager;
    use crate::object_store::{MockFailure, MockObjectStore};
    use crate::wal::MemoryWal;

    fn record(stream: u64, base: u64, last: u64, body_len: usize) -> StreamRecord {
        StreamRecord::new(stream, base, last, Bytes::from(vec![0u8; body_len])).unwrap()
    }

    fn archived_block(cache: &LogCache, records: Vec<StreamRecord>) -> Arc<CacheBlock> {
        for record in records {
            cache.put(record);
        }
        cache.archive_current_if_contains(None).unwrap()
    }

    fn test_config() -> StorageConfig {
        StorageConfig {
            stream_split_size: 1024,
            ..StorageConfig::default()
        }
    }

    fn pipeline_fixture() -> (
        Arc<UploadPipeline>,
        Arc<LogCache>,
        MemoryObjectManager,
        MockObjectStore,
    ) {
        let cache = Arc::new(LogCache::new(u64::MAX));
        let manager = MemoryObjectManager::new();
        let store = MockObjectStore::new();
        let wal: Arc<dyn WalDevice> = Arc::new(MemoryWal::new());
        let pipeline = UploadPipeline::new(
            test_config(),
            Arc::new(manager.clone()),
            Arc::new(store.clone()),
            wal,
            Arc::clone(&cache),
        );
        (pipeline, cache, manager, store)
    }

    #[test]
    fn planner_splits_large_streams() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 0, 2048)); // above split threshold
        cache.put(record(2, 0, 0, 16)); // stays in the set object
        let block = cache.archive_current_if_contains(None).unwrap();

        let plan = plan_block(&block, 1024, 10_000);
        assert_eq!(plan.split.len(), 1);
        assert_eq!(plan.split[0].0, 1);
        assert_eq!(plan.stream_set.len(), 1);
        assert_eq!(plan.stream_set[0].0, 2);
    }

    #[test]
    fn planner_promotes_overflow_streams() {
        let cache = LogCache::new(u64::MAX);
        for stream in 0..4u64 {
            cache.put(record(stream, 0, 0, 16 + stream as usize));
        }
        let block = cache.archive_current_if_contains(None).unwrap();

        let plan = plan_block(&block, 1024, 2);
        assert_eq!(plan.stream_set.len(), 2);
        assert_eq!(plan.split.len(), 2);
        // Largest streams leave the set object first.
        let split_ids: Vec<u64> = plan.split.iter().map(|(id, _)| *id).collect();
        assert_eq!(split_ids, vec![2, 3]);
    }

    #[test]
    fn build_objects_assigns_ids_and_layout() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 9, 64));
        cache.put(record(1, 10, 19, 64));
        cache.put(record(2, 0, 4, 2048));
        let block = cache.archive_current_if_contains(None).unwrap();

        let plan = plan_block(&block, 1024, 10_000);
        let objects = build_objects(&plan, 40);

        let manifest = objects.manifest.unwrap();
        assert_eq!(manifest.object_id, 40);
        let range = manifest.stream_range(1).unwrap();
        assert_eq!(range.start_offset, 0);
        assert_eq!(range.end_offset, 20);
        assert_eq!(range.data_offset, 0);
        assert_eq!(range.data_size, manifest.size);

        assert_eq!(objects.stream_objects.len(), 1);
        assert_eq!(objects.stream_objects[0].object_id, 41);
        assert_eq!(objects.stream_objects[0].stream_id, 2);
        assert_eq!(objects.payloads.len(), 2);
    }

    #[tokio::test]
    async fn tasks_commit_in_enqueue_order_with_monotone_ids() {
        let (pipeline, cache, manager, _store) = pipeline_fixture();

        let first = archived_block(&cache, vec![record(1, 0, 9, 64)]);
        let second = archived_block(&cache, vec![record(1, 10, 19, 64)]);

        let w1 = pipeline.enqueue(first);
        let w2 = pipeline.enqueue(second);
        w1.wait().await.unwrap();
        w2.wait().await.unwrap();
        pipeline.wait_idle().await;

        let ids = manager.committed_object_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn committed_block_trims_wal_to_confirm_offset() {
        let cache = Arc::new(LogCache::new(u64::MAX));
        let wal = MemoryWal::new();
        for body in [&b"aaaa"[..], b"bbbb", b"cccc"] {
            wal.append(Bytes::copy_from_slice(body)).unwrap();
        }
        let manager = MemoryObjectManager::new();
        let store = MockObjectStore::new();
        let pipeline = UploadPipeline::new(
            test_config(),
            Arc::new(manager.clone()),
            Arc::new(store.clone()),
            Arc::new(wal.clone()),
            Arc::clone(&cache),
        );

        cache.put(record(1, 0, 0, 16));
        cache.set_confirm_offset(1);
        let block = cache.archive_current_if_contains(None).unwrap();
        pipeline.enqueue(block).wait().await.unwrap();

        // Offsets 0 and 1 trimmed; 2 survives.
        let recovered = wal.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].offset, 2);
    }

    #[tokio::test]
    async fn failed_upload_leaves_block_archived_for_retry() {
        let cache = Arc::new(LogCache::new(u64::MAX));
        let manager = MemoryObjectManager::new();
        let store = MockObjectStore::with_failures(vec![MockFailure::Transient("503")]);
        let wal: Arc<dyn WalDevice> = Arc::new(MemoryWal::new());
        let pipeline = UploadPipeline::new(
            test_config(),
            Arc::new(manager.clone()),
            Arc::new(store.clone()),
            wal,
            Arc::clone(&cache),
        );

        cache.put(record(1, 0, 0, 16));
        let block = cache.archive_current_if_contains(None).unwrap();

        let err = pipeline.enqueue(Arc::clone(&block)).wait().await.unwrap_err();
        assert!(matches!(err, StorageError::Upload { .. }));
        pipeline.wait_idle().await;
        assert_eq!(cache.archived_blocks().len(), 1);

        // Retry succeeds and frees the block.
        pipeline.enqueue(block).wait().await.unwrap();
        assert!(cache.archived_blocks().is_empty());
        assert_eq!(manager.committed_object_ids().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_block() {
        let (pipeline, cache, manager, store) = pipeline_fixture();
        store.hold_puts();

        let block = archived_block(&cache, vec![record(1, 0, 0, 16)]);
        let w1 = pipeline.enqueue(Arc::clone(&block));
        let w2 = pipeline.enqueue(block);
        assert_eq!(pipeline.inflight(), 1);

        store.release_puts();
        w1.wait().await.unwrap();
        w2.wait().await.unwrap();
        assert_eq!(manager.committed_object_ids().len(), 1);
    }
}
