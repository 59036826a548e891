//! Two-generation in-memory cache of recently appended records.
//!
//! One ACTIVE block absorbs inserts; crossing the flush threshold signals
//! the caller to start an upload, which rotates the block to ARCHIVED.
//! Archived blocks feed the upload pipeline in creation order and keep
//! serving reads until they are freed after commit. Under memory
//! pressure the oldest archived blocks are dropped first.
//!
//! Structural mutation (rotation, freeing) is serialized by one lock on
//! the cache; per-stream insert order is the sequencer stripe's job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use silt_core::record::StreamRecord;

/// Lifecycle of a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Absorbing inserts.
    Active,
    /// Rotated out, awaiting (or retrying) upload.
    Archived,
    /// Uploaded and committed, or evicted; records released.
    Freed,
}

/// An immutable archived generation of the cache.
///
/// Shared with the upload task that rolls it into a remote object. The
/// record map does not change after rotation; only the state does.
pub struct CacheBlock {
    seq: u64,
    size: u64,
    confirm_offset: Option<u64>,
    records: HashMap<u64, Vec<StreamRecord>>,
    state: Mutex<BlockState>,
}

impl CacheBlock {
    /// Position in archive order; earlier blocks upload and commit first.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Total frame bytes held by the block.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// WAL offset through which all contained records are durable.
    #[must_use]
    pub fn confirm_offset(&self) -> Option<u64> {
        self.confirm_offset
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BlockState {
        *self.state.lock()
    }

    /// Records per stream, insertion order equal to offset order.
    #[must_use]
    pub fn records(&self) -> &HashMap<u64, Vec<StreamRecord>> {
        &self.records
    }

    /// Stream ids present in the block, sorted.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

struct ActiveBlock {
    records: HashMap<u64, Vec<StreamRecord>>,
    size: u64,
}

impl ActiveBlock {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            size: 0,
        }
    }
}

struct CacheInner {
    active: ActiveBlock,
    archived: VecDeque<Arc<CacheBlock>>,
    archived_bytes: u64,
    confirm_offset: Option<u64>,
    next_seq: u64,
}

/// The log cache.
pub struct LogCache {
    inner: Mutex<CacheInner>,
    flush_threshold: u64,
}

impl LogCache {
    /// Cache whose active block signals a flush at `flush_threshold`
    /// bytes.
    #[must_use]
    pub fn new(flush_threshold: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                active: ActiveBlock::new(),
                archived: VecDeque::new(),
                archived_bytes: 0,
                confirm_offset: None,
                next_seq: 0,
            }),
            flush_threshold,
        }
    }

    /// Inserts a record into the active block.
    ///
    /// Returns true when this insert pushed the active block across the
    /// flush threshold; the caller then initiates an upload. Per-stream
    /// call order must equal offset order (the sequencer guarantees it).
    pub fn put(&self, record: StreamRecord) -> bool {
        let mut inner = self.inner.lock();
        let old_size = inner.active.size;
        let new_size = old_size + record.size() as u64;
        inner
            .active
            .records
            .entry(record.stream_id())
            .or_default()
            .push(record);
        inner.active.size = new_size;
        old_size < self.flush_threshold && new_size >= self.flush_threshold
    }

    /// Longest contiguous in-cache slice for `stream_id`.
    ///
    /// Starts at the record containing `start` (or the first record past
    /// it when the head is no longer cached, signalling a partial hit),
    /// ends before `end`, and stops once accumulated bytes reach
    /// `max_bytes` - the record crossing the budget is included.
    pub fn get(&self, stream_id: u64, start: u64, end: u64, max_bytes: u64) -> Vec<StreamRecord> {
        let inner = self.inner.lock();

        // Archived generations first (older), then the active block;
        // per-stream concatenation preserves offset order.
        let mut records: Vec<&StreamRecord> = Vec::new();
        for block in &inner.archived {
            if let Some(list) = block.records.get(&stream_id) {
                records.extend(list.iter());
            }
        }
        if let Some(list) = inner.active.records.get(&stream_id) {
            records.extend(list.iter());
        }
        if records.is_empty() {
            return Vec::new();
        }

        // First candidate: the record containing `start` when cached,
        // otherwise the first record past it.
        let first = records.partition_point(|r| r.last_offset() < start);
        let mut result: Vec<StreamRecord> = Vec::new();
        let mut prev: Option<&StreamRecord> = None;
        let mut bytes = 0u64;
        for record in &records[first..] {
            if record.base_offset() >= end {
                break;
            }
            if prev.is_some_and(|p| !p.is_continuous_with(record)) {
                break;
            }
            result.push((*record).clone());
            bytes += record.size() as u64;
            prev = Some(record);
            if bytes >= max_bytes {
                break;
            }
        }
        result
    }

    /// Records the WAL offset through which all cached records are
    /// durable; stamped onto the block at rotation. Never moves
    /// backwards, so racing acknowledgement callbacks may publish in any
    /// order.
    pub fn set_confirm_offset(&self, offset: u64) {
        let mut inner = self.inner.lock();
        if inner.confirm_offset.map_or(true, |prev| offset > prev) {
            inner.confirm_offset = Some(offset);
        }
    }

    /// Rotates the active block to ARCHIVED if it holds any record for
    /// `stream_id` (or any record at all when `None`).
    pub fn archive_current_if_contains(&self, stream_id: Option<u64>) -> Option<Arc<CacheBlock>> {
        let mut inner = self.inner.lock();
        let matches = match stream_id {
            Some(id) => inner.active.records.contains_key(&id),
            None => !inner.active.records.is_empty(),
        };
        if !matches {
            return None;
        }

        let active = std::mem::replace(&mut inner.active, ActiveBlock::new());
        let block = Arc::new(CacheBlock {
            seq: inner.next_seq,
            size: active.size,
            confirm_offset: inner.confirm_offset,
            records: active.records,
            state: Mutex::new(BlockState::Archived),
        });
        inner.next_seq += 1;
        inner.archived_bytes += block.size;
        inner.archived.push_back(Arc::clone(&block));
        debug!(
            block_seq = block.seq,
            size = block.size,
            confirm_offset = ?block.confirm_offset,
            "archived cache block"
        );
        Some(block)
    }

    /// Transitions an ARCHIVED block to FREED and releases its records.
    pub fn mark_free(&self, block: &Arc<CacheBlock>) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.archived.iter().position(|b| b.seq == block.seq) {
            inner.archived.remove(pos);
            inner.archived_bytes -= block.size;
            *block.state.lock() = BlockState::Freed;
        }
    }

    /// Frees oldest ARCHIVED blocks until `bytes` are released or none
    /// remain. Returns the bytes actually freed.
    pub fn force_free(&self, bytes: u64) -> u64 {
        let mut inner = self.inner.lock();
        let mut freed = 0u64;
        while freed < bytes {
            let Some(block) = inner.archived.pop_front() else {
                break;
            };
            inner.archived_bytes -= block.size;
            freed += block.size;
            *block.state.lock() = BlockState::Freed;
            debug!(block_seq = block.seq, size = block.size, "force-freed cache block");
        }
        freed
    }

    /// Archived blocks in creation order, oldest first.
    #[must_use]
    pub fn archived_blocks(&self) -> Vec<Arc<CacheBlock>> {
        self.inner.lock().archived.iter().cloned().collect()
    }

    /// Total bytes across the active and archived generations.
    #[must_use]
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.active.size + inner.archived_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use silt_core::record::RECORD_HEADER_SIZE;

    fn record(stream: u64, base: u64, last: u64, body_len: usize) -> StreamRecord {
        StreamRecord::new(stream, base, last, Bytes::from(vec![0u8; body_len])).unwrap()
    }

    fn frame_size(body_len: usize) -> u64 {
        (RECORD_HEADER_SIZE + body_len) as u64
    }

    #[test]
    fn put_signals_threshold_crossing_once() {
        let cache = LogCache::new(3 * frame_size(100));
        assert!(!cache.put(record(1, 0, 0, 100)));
        assert!(!cache.put(record(1, 1, 1, 100)));
        assert!(cache.put(record(1, 2, 2, 100)));
        // Already above the threshold; no new crossing.
        assert!(!cache.put(record(1, 3, 3, 100)));
    }

    #[test]
    fn get_returns_contiguous_slice_from_start() {
        let cache = LogCache::new(u64::MAX);
        for base in 0..5u64 {
            cache.put(record(1, base * 10, base * 10 + 9, 10));
        }

        let records = cache.get(1, 20, 50, u64::MAX);
        let bases: Vec<u64> = records.iter().map(|r| r.base_offset()).collect();
        assert_eq!(bases, vec![20, 30, 40]);
    }

    #[test]
    fn get_includes_record_containing_start() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 9, 10));
        cache.put(record(1, 10, 19, 10));

        let records = cache.get(1, 5, 20, u64::MAX);
        assert_eq!(records[0].base_offset(), 0);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn get_partial_hit_starts_past_requested_offset() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 50, 59, 10));
        cache.put(record(1, 60, 69, 10));

        // Head [40, 50) is not cached; result starts strictly after.
        let records = cache.get(1, 40, 70, u64::MAX);
        assert_eq!(records[0].base_offset(), 50);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn get_honors_inclusive_byte_budget() {
        let cache = LogCache::new(u64::MAX);
        for base in 0..4u64 {
            cache.put(record(1, base, base, 100));
        }

        // Budget covers one frame and change: the crossing record is
        // included, nothing after it.
        let records = cache.get(1, 0, 4, frame_size(100) + 1);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn get_spans_archived_and_active_generations() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 9, 10));
        cache.archive_current_if_contains(Some(1)).unwrap();
        cache.put(record(1, 10, 19, 10));

        let records = cache.get(1, 0, 20, u64::MAX);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_continuous_with(&records[1]));
    }

    #[test]
    fn archive_respects_stream_filter() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 0, 10));

        assert!(cache.archive_current_if_contains(Some(2)).is_none());
        let block = cache.archive_current_if_contains(Some(1)).unwrap();
        assert_eq!(block.state(), BlockState::Archived);
        assert_eq!(block.stream_ids(), vec![1]);

        // Active block is empty now; wildcard archive finds nothing.
        assert!(cache.archive_current_if_contains(None).is_none());
    }

    #[test]
    fn archive_stamps_confirm_offset() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 0, 10));
        cache.set_confirm_offset(41);

        let block = cache.archive_current_if_contains(None).unwrap();
        assert_eq!(block.confirm_offset(), Some(41));
    }

    #[test]
    fn mark_free_releases_block_bytes() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 0, 10));
        let size = cache.size();
        let block = cache.archive_current_if_contains(None).unwrap();
        assert_eq!(cache.size(), size);

        cache.mark_free(&block);
        assert_eq!(cache.size(), 0);
        assert_eq!(block.state(), BlockState::Freed);
    }

    #[test]
    fn force_free_evicts_oldest_archived_first() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 0, 10));
        let first = cache.archive_current_if_contains(None).unwrap();
        cache.put(record(1, 1, 1, 10));
        let second = cache.archive_current_if_contains(None).unwrap();

        let freed = cache.force_free(1);
        assert_eq!(freed, first.size());
        assert_eq!(first.state(), BlockState::Freed);
        assert_eq!(second.state(), BlockState::Archived);

        // Requesting more than remains frees what it can.
        let freed = cache.force_free(u64::MAX);
        assert_eq!(freed, second.size());
        assert_eq!(cache.size(), 0);
    }
}
