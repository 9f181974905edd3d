//! Entry frame codec with optional per-entry compression.
//!
//! Each entry is a length-prefixed frame:
//!
//! ```text
//! [entryCRC:4][entryByteLength:4][entryId:4][flags:2] payload...
//! ```
//!
//! `entryByteLength` is the stored payload length — the compressed length
//! when `FLAG_COMPRESSED` is set. The CRC covers everything after itself
//! (length, id, flags, payload). The per-entry id is the segment's random
//! id plus the entry's ordinal and exists to catch frames that belong to a
//! stale or foreign segment.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the entry frame header in bytes.
pub const ENTRY_HEADER_BYTES: usize = 14;

/// Flag value for an uncompressed entry.
pub const NO_FLAGS: u16 = 0;

/// Flag value for an lz4-compressed entry. Mutually exclusive with
/// [`NO_FLAGS`].
pub const FLAG_COMPRESSED: u16 = 1;

/// Payloads below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 32;

/// Derives the per-entry id for an ordinal within a segment.
#[must_use]
pub const fn entry_id(random_id: u32, ordinal: u32) -> u32 {
    random_id.wrapping_add(ordinal)
}

/// An encoded entry frame ready to be written.
#[derive(Debug)]
pub struct EncodedFrame {
    /// The full frame (header plus stored payload).
    pub frame: BytesMut,
    /// Whether the payload was stored compressed.
    pub compressed: bool,
}

/// Encodes a payload into an entry frame.
///
/// Compression is attempted when enabled and the payload is at or above
/// [`COMPRESSION_THRESHOLD`]; the compressed form is kept only when it is
/// actually smaller than the raw payload.
#[must_use]
pub fn encode_frame(payload: &[u8], id: u32, compress: bool) -> EncodedFrame {
    let compressed_payload = if compress && payload.len() >= COMPRESSION_THRESHOLD {
        let candidate = lz4_flex::compress_prepend_size(payload);
        (candidate.len() < payload.len()).then_some(candidate)
    } else {
        None
    };

    let (stored, flags) = match &compressed_payload {
        Some(c) => (c.as_slice(), FLAG_COMPRESSED),
        None => (payload, NO_FLAGS),
    };

    let mut body = BytesMut::with_capacity(ENTRY_HEADER_BYTES - 4 + stored.len());
    body.put_u32_le(stored.len() as u32);
    body.put_u32_le(id);
    body.put_u16_le(flags);
    body.extend_from_slice(stored);

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32_le(crc32fast::hash(&body));
    frame.extend_from_slice(&body);

    EncodedFrame {
        frame,
        compressed: flags == FLAG_COMPRESSED,
    }
}

/// A successfully decoded entry.
#[derive(Debug)]
pub struct DecodedEntry {
    /// The uncompressed payload, owned.
    pub payload: Bytes,
    /// Bytes the frame occupies on disk (header plus stored payload).
    pub frame_len: usize,
    /// Whether the stored payload was compressed.
    pub compressed: bool,
}

/// Outcome of decoding one frame from a byte region.
#[derive(Debug)]
pub enum FrameCheck {
    /// A valid entry.
    Entry(DecodedEntry),
    /// The region ends before the frame does; the tail is incomplete.
    Incomplete,
    /// The frame fails CRC or structural validation.
    Corrupt(String),
}

/// Decodes and validates the frame starting at `at` within `data`.
///
/// `expected_id` is the per-entry id this ordinal must carry; a mismatch
/// marks the frame as belonging to a different segment generation and is
/// reported as corruption.
#[must_use]
pub fn decode_frame(data: &[u8], at: usize, expected_id: u32) -> FrameCheck {
    let Some(remaining) = data.len().checked_sub(at) else {
        return FrameCheck::Incomplete;
    };
    if remaining < ENTRY_HEADER_BYTES {
        return FrameCheck::Incomplete;
    }

    let header = &data[at..at + ENTRY_HEADER_BYTES];
    let stored_crc = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    let stored_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
    let id = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
    let flags = u16::from_le_bytes(header[12..14].try_into().expect("2 bytes"));

    if stored_len == 0 {
        return FrameCheck::Corrupt("zero-length entry".to_string());
    }
    if remaining < ENTRY_HEADER_BYTES + stored_len {
        return FrameCheck::Incomplete;
    }
    if flags != NO_FLAGS && flags != FLAG_COMPRESSED {
        return FrameCheck::Corrupt(format!("invalid entry flags {flags:#06x}"));
    }

    let checked = &data[at + 4..at + ENTRY_HEADER_BYTES + stored_len];
    let actual_crc = crc32fast::hash(checked);
    if actual_crc != stored_crc {
        return FrameCheck::Corrupt(format!(
            "entry CRC mismatch: stored {stored_crc:08x}, computed {actual_crc:08x}"
        ));
    }

    if id != expected_id {
        return FrameCheck::Corrupt(format!(
            "entry id {id:#010x} does not match expected {expected_id:#010x}"
        ));
    }

    let stored = &data[at + ENTRY_HEADER_BYTES..at + ENTRY_HEADER_BYTES + stored_len];
    let payload = if flags == FLAG_COMPRESSED {
        match lz4_flex::decompress_size_prepended(stored) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => return FrameCheck::Corrupt(format!("entry decompression failed: {e}")),
        }
    } else {
        Bytes::copy_from_slice(stored)
    };

    FrameCheck::Entry(DecodedEntry {
        payload,
        frame_len: ENTRY_HEADER_BYTES + stored_len,
        compressed: flags == FLAG_COMPRESSED,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(payload: &[u8], compress: bool) -> DecodedEntry {
        let encoded = encode_frame(payload, entry_id(0x1000, 0), compress);
        match decode_frame(&encoded.frame, 0, entry_id(0x1000, 0)) {
            FrameCheck::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn uncompressed_round_trip() {
        let entry = roundtrip(b"hello world", false);
        assert_eq!(&entry.payload[..], b"hello world");
        assert!(!entry.compressed);
    }

    #[test]
    fn compressed_round_trip() {
        let payload = vec![7u8; 4096];
        let entry = roundtrip(&payload, true);
        assert_eq!(&entry.payload[..], &payload[..]);
        assert!(entry.compressed);
        assert!(entry.frame_len < ENTRY_HEADER_BYTES + payload.len());
    }

    #[test]
    fn small_payloads_stay_raw() {
        // Below the threshold, compression is never attempted.
        let entry = roundtrip(&[0u8; COMPRESSION_THRESHOLD - 1], true);
        assert!(!entry.compressed);
    }

    #[test]
    fn incompressible_payloads_stay_raw() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(64).collect();
        // Already high entropy per-byte variety; lz4 output will not shrink
        // a 64-byte non-repeating run below input size.
        let encoded = encode_frame(&payload, 1, true);
        let FrameCheck::Entry(entry) = decode_frame(&encoded.frame, 0, 1) else {
            panic!("decode failed");
        };
        assert_eq!(&entry.payload[..], &payload[..]);
    }

    #[test]
    fn crc_flip_is_corrupt() {
        let mut encoded = encode_frame(b"some payload bytes here", 9, false);
        let last = encoded.frame.len() - 1;
        encoded.frame[last] ^= 0x01;
        assert!(matches!(
            decode_frame(&encoded.frame, 0, 9),
            FrameCheck::Corrupt(_)
        ));
    }

    #[test]
    fn short_tail_is_incomplete() {
        let encoded = encode_frame(b"payload", 3, false);
        let truncated = &encoded.frame[..encoded.frame.len() - 2];
        assert!(matches!(
            decode_frame(truncated, 0, 3),
            FrameCheck::Incomplete
        ));
    }

    #[test]
    fn wrong_entry_id_is_corrupt() {
        let encoded = encode_frame(b"payload", 3, false);
        assert!(matches!(
            decode_frame(&encoded.frame, 0, 4),
            FrameCheck::Corrupt(_)
        ));
    }

    proptest! {
        #[test]
        fn any_payload_round_trips(payload in proptest::collection::vec(any::<u8>(), 1..4096),
                                   compress in any::<bool>()) {
            let encoded = encode_frame(&payload, 42, compress);
            let FrameCheck::Entry(entry) = decode_frame(&encoded.frame, 0, 42) else {
                panic!("decode failed");
            };
            prop_assert_eq!(&entry.payload[..], &payload[..]);
        }
    }
}
