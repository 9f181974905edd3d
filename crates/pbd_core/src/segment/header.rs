//! Fixed-offset segment header codec.
//!
//! Layout (all fields little-endian):
//!
//! ```text
//! [headerCRC:4][version:4][entryCount:4][totalBytes:4]
//! [startId:8][endId:8][lastTimestamp:8][randomId:4]
//! [extraHeaderSize:4][extraHeaderCRC:4]
//! ```
//!
//! followed by the extra-header blob of the declared size. The header CRC
//! covers bytes 4..52; the extra-header CRC covers the blob alone.

use crate::error::{PbdError, PbdResult};
use crate::types::{IdRange, INVALID_ID, INVALID_TIMESTAMP};
use bytes::{BufMut, BytesMut};

/// Size of the fixed header prefix in bytes.
pub const SEGMENT_HEADER_BYTES: usize = 52;

/// Current header format version.
pub const HEADER_VERSION: u32 = 1;

/// The fixed-offset segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Header format version.
    pub version: u32,
    /// Number of entries appended to the segment.
    pub entry_count: u32,
    /// Sum of uncompressed payload bytes across all entries.
    pub total_bytes: u32,
    /// First sequence id stored, or [`INVALID_ID`].
    pub start_id: i64,
    /// Last sequence id stored, or [`INVALID_ID`].
    pub end_id: i64,
    /// Timestamp (epoch millis) of the most recently appended entry.
    pub last_timestamp: i64,
    /// Random per-segment id; per-entry ids are derived from it.
    pub random_id: u32,
    /// Declared size of the extra-header blob.
    pub extra_header_size: u32,
    /// CRC32 of the extra-header blob.
    pub extra_header_crc: u32,
}

impl SegmentHeader {
    /// Creates the header of a fresh, empty segment.
    #[must_use]
    pub fn new(random_id: u32, extra_header: &[u8]) -> Self {
        Self {
            version: HEADER_VERSION,
            entry_count: 0,
            total_bytes: 0,
            start_id: INVALID_ID,
            end_id: INVALID_ID,
            last_timestamp: INVALID_TIMESTAMP,
            random_id,
            extra_header_size: extra_header.len() as u32,
            extra_header_crc: crc32fast::hash(extra_header),
        }
    }

    /// Records one appended entry.
    pub fn note_entry(&mut self, uncompressed_len: u32, ids: IdRange, timestamp: i64) {
        self.entry_count += 1;
        self.total_bytes += uncompressed_len;
        if !ids.is_untracked() {
            if self.start_id == INVALID_ID {
                self.start_id = ids.start;
            }
            self.end_id = ids.end;
        }
        self.last_timestamp = timestamp;
    }

    /// Returns true when the segment tracks caller sequence ids.
    #[must_use]
    pub const fn has_ids(&self) -> bool {
        self.start_id != INVALID_ID
    }

    /// Encodes the fixed header prefix, CRC first.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(SEGMENT_HEADER_BYTES - 4);
        body.put_u32_le(self.version);
        body.put_u32_le(self.entry_count);
        body.put_u32_le(self.total_bytes);
        body.put_i64_le(self.start_id);
        body.put_i64_le(self.end_id);
        body.put_i64_le(self.last_timestamp);
        body.put_u32_le(self.random_id);
        body.put_u32_le(self.extra_header_size);
        body.put_u32_le(self.extra_header_crc);

        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_BYTES);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.extend_from_slice(&body);
        buf
    }

    /// Decodes and CRC-verifies the fixed header prefix.
    ///
    /// # Errors
    ///
    /// Returns [`PbdError::ChecksumMismatch`] when the stored CRC does not
    /// match, and [`PbdError::InvalidOperation`] for a short buffer or an
    /// unsupported version.
    pub fn decode(data: &[u8]) -> PbdResult<Self> {
        if data.len() < SEGMENT_HEADER_BYTES {
            return Err(PbdError::invalid_operation(format!(
                "segment header truncated: {} of {} bytes",
                data.len(),
                SEGMENT_HEADER_BYTES
            )));
        }

        let stored_crc = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes"));
        let actual_crc = crc32fast::hash(&data[4..SEGMENT_HEADER_BYTES]);
        if stored_crc != actual_crc {
            return Err(PbdError::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let read_u32 = |at: usize| u32::from_le_bytes(data[at..at + 4].try_into().expect("4 bytes"));
        let read_i64 = |at: usize| i64::from_le_bytes(data[at..at + 8].try_into().expect("8 bytes"));

        let version = read_u32(4);
        if version > HEADER_VERSION {
            return Err(PbdError::invalid_operation(format!(
                "unsupported segment header version {version}"
            )));
        }

        Ok(Self {
            version,
            entry_count: read_u32(8),
            total_bytes: read_u32(12),
            start_id: read_i64(16),
            end_id: read_i64(24),
            last_timestamp: read_i64(32),
            random_id: read_u32(40),
            extra_header_size: read_u32(44),
            extra_header_crc: read_u32(48),
        })
    }

    /// Verifies the extra-header blob against the declared CRC.
    ///
    /// # Errors
    ///
    /// Returns [`PbdError::ChecksumMismatch`] on mismatch.
    pub fn verify_extra_header(&self, blob: &[u8]) -> PbdResult<()> {
        let actual = crc32fast::hash(blob);
        if actual != self.extra_header_crc {
            return Err(PbdError::ChecksumMismatch {
                expected: self.extra_header_crc,
                actual,
            });
        }
        Ok(())
    }

    /// Offset of the first entry: fixed prefix plus extra-header blob.
    #[must_use]
    pub const fn data_start(&self) -> u64 {
        SEGMENT_HEADER_BYTES as u64 + self.extra_header_size as u64
    }
}
