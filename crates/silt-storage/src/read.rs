//! Read path: merge of log-cache hits with remote-block-cache data under
//! a byte budget and a continuity invariant.

use std::sync::Arc;

use silt_core::error::{StorageError, StorageResult};
use silt_core::record::StreamRecord;

use crate::block_cache::RemoteBlockCache;
use crate::cache::LogCache;

/// Where the head of a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccess {
    /// The log cache held the head of the requested range.
    CacheHit,
    /// The head came from the remote block cache.
    CacheMiss,
}

/// Result of a merged read.
#[derive(Debug)]
pub struct ReadDataBlock {
    pub records: Vec<StreamRecord>,
    pub access: CacheAccess,
}

impl ReadDataBlock {
    /// Total frame bytes across the returned records.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.records.iter().map(|r| r.size() as u64).sum()
    }
}

/// Reads `[start, end)` of a stream, serving the head from the log cache
/// when possible and falling back to the remote block cache for the rest.
///
/// The budget is inclusive: the record that pushes the accumulated size
/// past `max_bytes` is returned, so any request matching at least one
/// record returns at least one record. Cache records beyond the last
/// consumed one are released.
///
/// # Errors
///
/// Returns `StorageError::Integrity` when the merged list has an offset
/// gap; the error is fatal to this request only.
pub async fn read_merged(
    cache: &LogCache,
    remote: &Arc<dyn RemoteBlockCache>,
    stream_id: u64,
    start: u64,
    end: u64,
    max_bytes: u64,
) -> StorageResult<ReadDataBlock> {
    let cache_records = cache.get(stream_id, start, end, max_bytes);

    if cache_records
        .first()
        .map_or(false, |r| r.base_offset() <= start)
    {
        let block = ReadDataBlock {
            records: cache_records,
            access: CacheAccess::CacheHit,
        };
        validate_continuity(&block.records)?;
        return Ok(block);
    }

    // The cache no longer holds the head; ask the remote block cache for
    // everything up to the first cached record.
    let cache_start = cache_records
        .first()
        .map_or(end, |r| r.base_offset());
    let remote_block = remote
        .read(stream_id, start, cache_start, max_bytes)
        .await?;

    let mut records = remote_block.records;
    let mut bytes: u64 = records.iter().map(|r| r.size() as u64).sum();
    for record in cache_records {
        if bytes >= max_bytes {
            break;
        }
        bytes += record.size() as u64;
        records.push(record);
    }

    validate_continuity(&records)?;
    Ok(ReadDataBlock {
        records,
        access: CacheAccess::CacheMiss,
    })
}

fn validate_continuity(records: &[StreamRecord]) -> StorageResult<()> {
    for pair in records.windows(2) {
        if !pair[0].is_continuous_with(&pair[1]) {
            return Err(StorageError::integrity(format!(
                "merged read is discontinuous: stream {} record ending at {} followed by base {}",
                pair[0].stream_id(),
                pair[0].last_offset(),
                pair[1].base_offset()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::MemoryBlockCache;
    use bytes::Bytes;

    fn record(stream: u64, base: u64, last: u64, body_len: usize) -> StreamRecord {
        StreamRecord::new(stream, base, last, Bytes::from(vec![0u8; body_len])).unwrap()
    }

    fn remote_with(records: Vec<StreamRecord>) -> Arc<dyn RemoteBlockCache> {
        let remote = MemoryBlockCache::new();
        remote.insert_all(records);
        Arc::new(remote)
    }

    #[tokio::test]
    async fn cache_hit_skips_remote() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 0, 9, 10));
        cache.put(record(1, 10, 19, 10));
        let remote = remote_with(Vec::new());

        let block = read_merged(&cache, &remote, 1, 0, 20, u64::MAX)
            .await
            .unwrap();
        assert_eq!(block.access, CacheAccess::CacheHit);
        assert_eq!(block.records.len(), 2);
    }

    #[tokio::test]
    async fn merges_remote_head_with_cache_tail() {
        let cache = LogCache::new(u64::MAX);
        for base in [50u64, 60, 70, 80, 90] {
            cache.put(record(1, base, base + 9, 10));
        }
        let remote = remote_with((0..5).map(|i| record(1, i * 10, i * 10 + 9, 10)).collect());

        let block = read_merged(&cache, &remote, 1, 40, 90, u64::MAX)
            .await
            .unwrap();
        assert_eq!(block.access, CacheAccess::CacheMiss);
        let bases: Vec<u64> = block.records.iter().map(|r| r.base_offset()).collect();
        assert_eq!(bases, vec![40, 50, 60, 70, 80]);
    }

    #[tokio::test]
    async fn pure_remote_read_when_cache_is_empty() {
        let cache = LogCache::new(u64::MAX);
        let remote = remote_with((0..3).map(|i| record(1, i * 10, i * 10 + 9, 10)).collect());

        let block = read_merged(&cache, &remote, 1, 0, 30, u64::MAX)
            .await
            .unwrap();
        assert_eq!(block.records.len(), 3);
        assert_eq!(block.access, CacheAccess::CacheMiss);
    }

    #[tokio::test]
    async fn byte_budget_stops_cache_tail() {
        let cache = LogCache::new(u64::MAX);
        for base in [10u64, 20] {
            cache.put(record(1, base, base + 9, 100));
        }
        let remote = remote_with(vec![record(1, 0, 9, 100)]);

        // Budget covers the remote record plus one cache record.
        let first = read_merged(&cache, &remote, 1, 0, 30, 150)
            .await
            .unwrap();
        let bases: Vec<u64> = first.records.iter().map(|r| r.base_offset()).collect();
        assert_eq!(bases, vec![0, 10]);
    }

    #[tokio::test]
    async fn discontinuous_merge_is_an_integrity_error() {
        let cache = LogCache::new(u64::MAX);
        cache.put(record(1, 50, 59, 10));
        // Remote only covers [0, 40): a hole remains before the cache head.
        let remote = remote_with((0..4).map(|i| record(1, i * 10, i * 10 + 9, 10)).collect());

        let err = read_merged(&cache, &remote, 1, 0, 60, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity { .. }));
    }
}
