//! Stream record batches and their wire format.
//!
//! ## Frame Layout
//!
//! ```text
//! ├─ magic/version: u8      = 0x53
//! ├─ stream_id: u64         big-endian
//! ├─ base_offset: u64       big-endian
//! ├─ last_offset_delta: u32 big-endian, last = base + delta
//! ├─ payload_length: u32    big-endian
//! └─ payload: [u8; payload_length]
//! ```
//!
//! The same frame is written to the WAL and into remote objects, so a
//! record is encoded exactly once, before admission to the append
//! pipeline.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

/// Magic/version byte for the record frame format.
pub const RECORD_MAGIC: u8 = 0x53;

/// Fixed frame header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4;

/// An immutable record batch belonging to one stream.
///
/// The batch covers the inclusive offset range `[base_offset, last_offset]`
/// of its stream. Payload and encoded form are backed by [`Bytes`], so
/// cloning is cheap and the backing memory is freed when the last handle
/// drops.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    stream_id: u64,
    base_offset: u64,
    last_offset: u64,
    payload: Bytes,
    encoded: Bytes,
}

impl StreamRecord {
    /// Builds a record and eagerly encodes its wire frame.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Integrity` when `last_offset < base_offset`,
    /// and `StorageError::Codec` when the offset delta or payload length
    /// does not fit the frame header.
    pub fn new(
        stream_id: u64,
        base_offset: u64,
        last_offset: u64,
        payload: Bytes,
    ) -> StorageResult<Self> {
        if last_offset < base_offset {
            return Err(StorageError::integrity(format!(
                "record last offset {} precedes base offset {}",
                last_offset, base_offset
            )));
        }
        let delta = u32::try_from(last_offset - base_offset).map_err(|_| {
            StorageError::codec(format!(
                "offset delta {} exceeds u32",
                last_offset - base_offset
            ))
        })?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| StorageError::codec(format!("payload of {} bytes exceeds u32", payload.len())))?;

        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        frame.push(RECORD_MAGIC);
        frame
            .write_u64::<BigEndian>(stream_id)
            .and_then(|()| frame.write_u64::<BigEndian>(base_offset))
            .and_then(|()| frame.write_u32::<BigEndian>(delta))
            .and_then(|()| frame.write_u32::<BigEndian>(payload_len))
            .map_err(|e| StorageError::codec(format!("failed to encode frame header: {}", e)))?;
        frame.extend_from_slice(&payload);

        Ok(Self {
            stream_id,
            base_offset,
            last_offset,
            payload,
            encoded: Bytes::from(frame),
        })
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Payload and encoded form are zero-copy slices of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Codec` on an unknown magic byte or a
    /// truncated header/payload.
    pub fn decode(buf: &Bytes) -> StorageResult<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(StorageError::codec(format!(
                "truncated frame header: {} bytes, need {}",
                buf.len(),
                RECORD_HEADER_SIZE
            )));
        }
        let mut cursor = Cursor::new(&buf[..RECORD_HEADER_SIZE]);
        let magic = cursor
            .read_u8()
            .map_err(|e| StorageError::codec(e.to_string()))?;
        if magic != RECORD_MAGIC {
            return Err(StorageError::codec(format!(
                "unknown record magic {:#04x}",
                magic
            )));
        }
        let stream_id = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| StorageError::codec(e.to_string()))?;
        let base_offset = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| StorageError::codec(e.to_string()))?;
        let delta = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| StorageError::codec(e.to_string()))?;
        let payload_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| StorageError::codec(e.to_string()))? as usize;

        let frame_len = RECORD_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            return Err(StorageError::codec(format!(
                "truncated payload: frame needs {} bytes, have {}",
                frame_len,
                buf.len()
            )));
        }

        Ok(Self {
            stream_id,
            base_offset,
            last_offset: base_offset + u64::from(delta),
            payload: buf.slice(RECORD_HEADER_SIZE..frame_len),
            encoded: buf.slice(..frame_len),
        })
    }

    /// Decodes a buffer of concatenated frames, in order.
    ///
    /// Used for WAL recovery and for reading back object contents.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Codec` when any frame is malformed; trailing
    /// garbage is an error, not a partial result.
    pub fn decode_all(buf: &Bytes) -> StorageResult<Vec<Self>> {
        let mut records = Vec::new();
        let mut rest = buf.clone();
        while !rest.is_empty() {
            let record = Self::decode(&rest)?;
            rest = rest.slice(record.size()..);
            records.push(record);
        }
        Ok(records)
    }

    /// Stream the batch belongs to.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// First offset covered by the batch, inclusive.
    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Last offset covered by the batch, inclusive.
    #[must_use]
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    /// Offset one past the batch, i.e. the next record's expected base.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.last_offset + 1
    }

    /// Opaque record body.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Full wire frame, computed once at construction.
    #[must_use]
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// Size of the wire frame in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.encoded.len()
    }

    /// Whether `next` continues this batch without a gap.
    #[must_use]
    pub fn is_continuous_with(&self, next: &Self) -> bool {
        self.stream_id == next.stream_id && self.end_offset() == next.base_offset
    }
}
