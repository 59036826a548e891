//! Append-pipeline plumbing: write requests, completion handles, and the
//! backoff queue that parks rejected appends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use silt_core::error::{StorageError, StorageResult};
use silt_core::record::StreamRecord;

/// Sentinel for a request that has not been assigned a WAL offset yet.
const OFFSET_UNASSIGNED: u64 = u64::MAX;

/// One in-flight append.
///
/// Owned jointly by the sequencer queue and the WAL acknowledgement
/// continuation. The completion signal fires only after the record has
/// been inserted into the cache in per-stream offset order.
pub struct WriteRequest {
    record: StreamRecord,
    offset: AtomicU64,
    persisted: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<StorageResult<()>>>>,
}

impl WriteRequest {
    /// Creates the request and the handle its caller awaits.
    pub fn new(record: StreamRecord) -> (Arc<Self>, AppendHandle) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            record,
            offset: AtomicU64::new(OFFSET_UNASSIGNED),
            persisted: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        });
        (request, AppendHandle { rx })
    }

    /// The record being appended.
    #[must_use]
    pub fn record(&self) -> &StreamRecord {
        &self.record
    }

    /// Stream the request belongs to.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.record.stream_id()
    }

    /// Assigns the WAL offset. Called once, under the sequencer stripe.
    pub fn set_wal_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    /// WAL offset, if assigned.
    #[must_use]
    pub fn wal_offset(&self) -> Option<u64> {
        match self.offset.load(Ordering::Acquire) {
            OFFSET_UNASSIGNED => None,
            offset => Some(offset),
        }
    }

    /// Marks the record durable in the WAL.
    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }

    /// Whether the WAL has acknowledged the record.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Resolves the caller's future. Later calls are no-ops.
    pub fn complete(&self, result: StorageResult<()>) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// Future side of an append; resolves when the record is durable and
/// acknowledged in order.
pub struct AppendHandle {
    rx: oneshot::Receiver<StorageResult<()>>,
}

impl AppendHandle {
    /// Waits for the append to complete.
    ///
    /// # Errors
    ///
    /// Propagates the append's failure; a dropped sender (storage torn
    /// down mid-flight) maps to `StorageError::Shutdown`.
    pub async fn wait(self) -> StorageResult<()> {
        self.rx.await.map_err(|_| StorageError::Shutdown)?
    }
}

/// FIFO of appends rejected by admission, retried by the drain task.
#[derive(Default)]
pub struct BackoffQueue {
    inner: Mutex<VecDeque<Arc<WriteRequest>>>,
}

impl BackoffQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any request is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of parked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Parks a request at the tail.
    pub fn push(&self, request: Arc<WriteRequest>) {
        self.inner.lock().push_back(request);
    }

    /// Takes the head for a retry attempt.
    #[must_use]
    pub fn pop(&self) -> Option<Arc<WriteRequest>> {
        self.inner.lock().pop_front()
    }

    /// Returns a failed retry to the head.
    pub fn push_front(&self, request: Arc<WriteRequest>) {
        self.inner.lock().push_front(request);
    }

    /// Fails every parked request; used at shutdown.
    pub fn fail_all(&self, error: impl Fn() -> StorageError) {
        let drained: Vec<_> = self.inner.lock().drain(..).collect();
        for request in drained {
            request.complete(Err(error()));
        }
    }
}

/// Emits at most one warning per interval; backpressure paths log through
/// this so a stalled upload does not flood the log.
pub struct RateLimitedWarn {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimitedWarn {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Runs `log` unless it ran within the interval.
    pub fn warn(&self, log: impl FnOnce()) {
        let mut last = self.last.lock();
        let now = Instant::now();
        if last.map_or(true, |at| now.duration_since(at) >= self.interval) {
            *last = Some(now);
            log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request() -> (Arc<WriteRequest>, AppendHandle) {
        let record = StreamRecord::new(1, 0, 0, Bytes::from_static(b"x")).unwrap();
        WriteRequest::new(record)
    }

    #[tokio::test]
    async fn completion_fires_once() {
        let (req, handle) = request();
        req.complete(Ok(()));
        req.complete(Err(StorageError::Shutdown));
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn offset_starts_unassigned() {
        let (req, _handle) = request();
        assert_eq!(req.wal_offset(), None);
        req.set_wal_offset(17);
        assert_eq!(req.wal_offset(), Some(17));
    }

    #[tokio::test]
    async fn backoff_queue_preserves_head_on_retry_failure() {
        let queue = BackoffQueue::new();
        let (a, _ha) = request();
        let (b, _hb) = request();
        queue.push(Arc::clone(&a));
        queue.push(Arc::clone(&b));

        let head = queue.pop().unwrap();
        assert!(Arc::ptr_eq(&head, &a));
        queue.push_front(head);
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &a));
    }

    #[tokio::test]
    async fn fail_all_resolves_parked_requests() {
        let queue = BackoffQueue::new();
        let (req, handle) = request();
        queue.push(req);
        queue.fail_all(|| StorageError::Shutdown);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, StorageError::Shutdown));
        assert!(queue.is_empty());
    }

    #[test]
    fn rate_limited_warn_suppresses_within_interval() {
        let limiter = RateLimitedWarn::new(Duration::from_secs(60));
        let mut count = 0;
        limiter.warn(|| count += 1);
        limiter.warn(|| count += 1);
        assert_eq!(count, 1);
    }
}
