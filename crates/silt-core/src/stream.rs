//! Stream metadata as reported by the stream manager.

use serde::{Deserialize, Serialize};

/// Descriptor of a currently-open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_id: u64,
    /// Writer epoch; passed back when closing the stream.
    pub epoch: u64,
    /// First offset still retained by the stream, inclusive.
    pub start_offset: u64,
    /// Next offset to be written; everything below is committed.
    pub end_offset: u64,
}

impl StreamMetadata {
    /// Whether `offset` is already committed and may be dropped on replay.
    #[must_use]
    pub fn is_committed(&self, offset: u64) -> bool {
        offset < self.end_offset
    }
}
