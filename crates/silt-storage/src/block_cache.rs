//! Remote block cache contract.
//!
//! Serves record ranges that have already been rolled into remote
//! objects. The production implementation lives with the object reader;
//! the in-memory implementation here backs tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use silt_core::error::StorageResult;
use silt_core::record::StreamRecord;

use crate::read::{CacheAccess, ReadDataBlock};

/// Read-side collaborator for data no longer held by the log cache.
#[async_trait]
pub trait RemoteBlockCache: Send + Sync {
    /// Reads `[start_offset, end_offset)` of a stream up to `max_bytes`,
    /// budget inclusive of the final record.
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: u64,
    ) -> StorageResult<ReadDataBlock>;
}

/// In-memory [`RemoteBlockCache`] holding records per stream.
#[derive(Clone, Default)]
pub struct MemoryBlockCache {
    streams: Arc<Mutex<HashMap<u64, BTreeMap<u64, StreamRecord>>>>,
}

impl MemoryBlockCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one record, keyed by base offset.
    pub fn insert(&self, record: StreamRecord) {
        self.streams
            .lock()
            .entry(record.stream_id())
            .or_default()
            .insert(record.base_offset(), record);
    }

    /// Adds a batch of records.
    pub fn insert_all(&self, records: Vec<StreamRecord>) {
        for record in records {
            self.insert(record);
        }
    }
}

#[async_trait]
impl RemoteBlockCache for MemoryBlockCache {
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: u64,
    ) -> StorageResult<ReadDataBlock> {
        let streams = self.streams.lock();
        let mut records = Vec::new();
        let mut bytes = 0u64;
        if let Some(stream) = streams.get(&stream_id) {
            // Start at the record containing `start_offset` when present.
            let head = stream
                .range(..=start_offset)
                .next_back()
                .filter(|(_, r)| r.last_offset() >= start_offset)
                .map(|(base, _)| *base)
                .unwrap_or(start_offset);
            for (_, record) in stream.range(head..) {
                if record.base_offset() >= end_offset || bytes >= max_bytes {
                    break;
                }
                if records
                    .last()
                    .is_some_and(|prev: &StreamRecord| !prev.is_continuous_with(record))
                {
                    break;
                }
                bytes += record.size() as u64;
                records.push(record.clone());
            }
        }
        Ok(ReadDataBlock {
            records,
            access: CacheAccess::CacheMiss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(stream: u64, base: u64, last: u64) -> StreamRecord {
        StreamRecord::new(stream, base, last, Bytes::from_static(b"0123456789")).unwrap()
    }

    #[tokio::test]
    async fn reads_contiguous_range_within_bounds() {
        let cache = MemoryBlockCache::new();
        cache.insert_all((0..5).map(|i| record(1, i * 10, i * 10 + 9)).collect());

        let block = cache.read(1, 10, 40, u64::MAX).await.unwrap();
        let bases: Vec<u64> = block.records.iter().map(|r| r.base_offset()).collect();
        assert_eq!(bases, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn starts_inside_covering_record() {
        let cache = MemoryBlockCache::new();
        cache.insert(record(1, 0, 9));
        cache.insert(record(1, 10, 19));

        let block = cache.read(1, 5, 20, u64::MAX).await.unwrap();
        assert_eq!(block.records[0].base_offset(), 0);
        assert_eq!(block.records.len(), 2);
    }

    #[tokio::test]
    async fn unknown_stream_reads_empty() {
        let cache = MemoryBlockCache::new();
        let block = cache.read(9, 0, 10, u64::MAX).await.unwrap();
        assert!(block.records.is_empty());
    }
}
