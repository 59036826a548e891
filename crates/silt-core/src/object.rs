//! Manifests describing committed remote objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset range one stream occupies inside a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStreamRange {
    pub stream_id: u64,
    /// First stream offset covered, inclusive.
    pub start_offset: u64,
    /// One past the last stream offset covered.
    pub end_offset: u64,
    /// Byte position of the stream's first frame inside the object.
    pub data_offset: u64,
    /// Total frame bytes the stream contributes.
    pub data_size: u64,
}

/// Manifest for a stream-set object: one remote object aggregating record
/// frames of multiple streams, laid out stream by stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub object_id: u64,
    /// Object size in bytes.
    pub size: u64,
    /// Per-stream layout, ordered by stream id.
    pub streams: Vec<ObjectStreamRange>,
    pub committed_at: DateTime<Utc>,
}

impl ObjectManifest {
    /// Object-store key this manifest's data lives under.
    #[must_use]
    pub fn key(&self) -> String {
        object_key(self.object_id)
    }

    /// Range entry for `stream_id`, if the object contains it.
    #[must_use]
    pub fn stream_range(&self, stream_id: u64) -> Option<&ObjectStreamRange> {
        self.streams
            .iter()
            .find(|range| range.stream_id == stream_id)
    }
}

/// Manifest for a stream object: a remote object holding frames of exactly
/// one stream, split out of a cache block when the stream's byte count
/// crossed the split threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamObjectManifest {
    pub object_id: u64,
    pub stream_id: u64,
    /// First stream offset covered, inclusive.
    pub start_offset: u64,
    /// One past the last stream offset covered.
    pub end_offset: u64,
    /// Object size in bytes.
    pub size: u64,
    pub committed_at: DateTime<Utc>,
}

impl StreamObjectManifest {
    /// Object-store key this manifest's data lives under.
    #[must_use]
    pub fn key(&self) -> String {
        object_key(self.object_id)
    }
}

/// Canonical object-store key for an object id.
#[must_use]
pub fn object_key(object_id: u64) -> String {
    format!("objects/{:016x}", object_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_is_zero_padded_hex() {
        assert_eq!(object_key(0x2a), "objects/000000000000002a");
    }

    #[test]
    fn stream_range_lookup() {
        let manifest = ObjectManifest {
            object_id: 1,
            size: 64,
            streams: vec![ObjectStreamRange {
                stream_id: 9,
                start_offset: 0,
                end_offset: 10,
                data_offset: 0,
                data_size: 64,
            }],
            committed_at: Utc::now(),
        };

        assert!(manifest.stream_range(9).is_some());
        assert!(manifest.stream_range(8).is_none());
    }
}
