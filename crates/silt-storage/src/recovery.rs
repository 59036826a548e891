//! Startup recovery: replay the WAL, rebuild one cache block, flush it,
//! and hand the recovered streams back to the stream manager.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use silt_core::config::StorageConfig;
use silt_core::error::{StorageError, StorageResult};
use silt_core::record::StreamRecord;
use silt_core::stream::StreamMetadata;

use crate::cache::LogCache;
use crate::manager::{ObjectManager, StreamManager};
use crate::object_store::ObjectStore;
use crate::upload::upload_block_once;
use crate::wal::WalDevice;

/// Replays the WAL into `cache`, synchronously uploads whatever survives
/// filtering, resets the WAL, and closes the recovered streams.
///
/// Records for streams that are not open, or whose base offset precedes
/// the stream's committed end offset, are dropped. The remaining records
/// of each stream must continue exactly from the committed end offset
/// with no gaps.
///
/// # Errors
///
/// Returns `StorageError::Integrity` on a per-stream offset gap; callers
/// treat any recovery error as fatal to the process.
pub async fn recover_and_flush(
    config: &StorageConfig,
    wal: &Arc<dyn WalDevice>,
    cache: &Arc<LogCache>,
    object_manager: &Arc<dyn ObjectManager>,
    object_store: &Arc<dyn ObjectStore>,
    stream_manager: &Arc<dyn StreamManager>,
) -> StorageResult<()> {
    let streams = stream_manager.get_opening_streams().await?;
    let metadata: HashMap<u64, StreamMetadata> =
        streams.iter().map(|s| (s.stream_id, *s)).collect();
    let mut next_expected: HashMap<u64, u64> = metadata
        .values()
        .map(|s| (s.stream_id, s.end_offset))
        .collect();

    let recovered = wal.recover().await?;
    let mut accepted = 0usize;
    let mut max_wal_offset = None;
    for entry in recovered {
        let record = StreamRecord::decode(&entry.data)?;
        let stream_id = record.stream_id();

        let Some(expected) = next_expected.get_mut(&stream_id) else {
            debug!(stream_id, wal_offset = entry.offset, "dropping record of closed stream");
            continue;
        };
        let committed_end = metadata[&stream_id].end_offset;
        if record.base_offset() < committed_end {
            debug!(
                stream_id,
                base_offset = record.base_offset(),
                committed_end,
                "dropping already-committed record"
            );
            continue;
        }
        if record.base_offset() != *expected {
            return Err(StorageError::integrity(format!(
                "recovered stream {} jumps from offset {} to {}",
                stream_id,
                *expected,
                record.base_offset()
            )));
        }
        *expected = record.end_offset();
        max_wal_offset = Some(entry.offset);
        cache.put(record);
        accepted += 1;
    }

    if let Some(offset) = max_wal_offset {
        cache.set_confirm_offset(offset);
    }

    if let Some(block) = cache.archive_current_if_contains(None) {
        info!(
            records = accepted,
            size = block.size(),
            "flushing recovered cache block"
        );
        upload_block_once(config, object_manager, object_store, &block).await?;
        cache.mark_free(&block);
        wal.reset().await?;
    }

    for stream in streams {
        stream_manager
            .close_stream(stream.stream_id, stream.epoch)
            .await?;
    }
    info!(records = accepted, "recovery complete");
    Ok(())
}
