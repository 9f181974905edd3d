//! One file-backed unit of the deque.
//!
//! A segment is a fixed-capacity header plus an append-only run of entry
//! frames. Exactly one segment per deque is writable at a time; the rest
//! are read-only or quarantined. Writes go through a plain `File` handle
//! (header rewrites are in-place at offset 0); reads go through a cached
//! read-only memory map that is lazily extended as the active segment
//! grows.

pub mod entry;
pub mod header;
pub mod quarantine;

pub use entry::{
    DecodedEntry, ENTRY_HEADER_BYTES, COMPRESSION_THRESHOLD, FLAG_COMPRESSED, NO_FLAGS,
};
pub use header::{SegmentHeader, HEADER_VERSION, SEGMENT_HEADER_BYTES};
pub use quarantine::{DequeSegment, QuarantinedSegment};

use crate::error::{PbdError, PbdResult};
use crate::naming;
use crate::types::{IdRange, SegmentIndex, INVALID_ID};
use bytes::Bytes;
use entry::FrameCheck;
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of offering a payload to a segment.
///
/// `DoesNotFit` is expected control flow — "roll to a new segment and
/// retry" — never corruption or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The entry was written; the value is the number of bytes it
    /// occupies on disk.
    Written(usize),
    /// The entry (plus its header) exceeds the segment's remaining
    /// capacity. The segment is unchanged. `frame` is the size the
    /// entry would have occupied, so the caller can tell a full
    /// segment from an entry no empty segment could hold.
    DoesNotFit {
        /// On-disk size of the rejected frame.
        frame: usize,
    },
}

/// Result of the recovery scan over a non-finalized segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverOutcome {
    /// Entries that survived validation.
    pub kept: u32,
    /// Entries recorded in the header but lost to corruption.
    pub dropped: u32,
    /// True when no entry survived and the whole segment should go.
    pub drop_segment: bool,
}

/// A regular (writable or read-only) segment.
pub struct Segment {
    path: PathBuf,
    fin_path: PathBuf,
    index: SegmentIndex,
    header: SegmentHeader,
    extra_header: Bytes,
    chunk_size: usize,
    compression: bool,
    /// Present while the segment is writable.
    writer: Option<File>,
    /// End of the entry region; the next frame starts here.
    write_offset: u64,
    dirty: bool,
    map: Option<Mmap>,
    pages_touched: bool,
}

impl Segment {
    /// Creates a fresh writable segment in `dir`.
    pub fn create(
        dir: &Path,
        nonce: &str,
        index: SegmentIndex,
        extra_header: &[u8],
        chunk_size: usize,
        compression: bool,
    ) -> PbdResult<Self> {
        let path = naming::file_path(dir, nonce, index, false);
        let fin_path = naming::finality_marker_path(dir, nonce, index);

        let header = SegmentHeader::new(rand::random::<u32>(), extra_header);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.write_all(extra_header)?;
        file.sync_all()?;
        sync_dir(dir)?;

        let write_offset = header.data_start();
        debug!(segment = %index, path = %path.display(), "created segment");
        Ok(Self {
            path,
            fin_path,
            index,
            header,
            extra_header: Bytes::copy_from_slice(extra_header),
            chunk_size,
            compression,
            writer: Some(file),
            write_offset,
            dirty: false,
            map: None,
            pages_touched: false,
        })
    }

    /// Opens an existing segment read-only, validating its header.
    pub fn open_for_read(
        dir: &Path,
        nonce: &str,
        index: SegmentIndex,
        chunk_size: usize,
        compression: bool,
    ) -> PbdResult<Self> {
        let path = naming::file_path(dir, nonce, index, false);
        let fin_path = naming::finality_marker_path(dir, nonce, index);

        let mut file = File::open(&path)?;
        let mut prefix = vec![0u8; SEGMENT_HEADER_BYTES];
        file.read_exact(&mut prefix)
            .map_err(|_| PbdError::corruption(&path, 0, "file shorter than segment header"))?;
        let header = SegmentHeader::decode(&prefix).map_err(|e| match e {
            PbdError::ChecksumMismatch { expected, actual } => PbdError::corruption(
                &path,
                0,
                format!("header CRC mismatch: stored {expected:08x}, computed {actual:08x}"),
            ),
            other => other,
        })?;

        let mut extra = vec![0u8; header.extra_header_size as usize];
        file.read_exact(&mut extra).map_err(|_| {
            PbdError::corruption(&path, SEGMENT_HEADER_BYTES as u64, "extra header truncated")
        })?;
        header.verify_extra_header(&extra).map_err(|_| {
            PbdError::corruption(&path, SEGMENT_HEADER_BYTES as u64, "extra header CRC mismatch")
        })?;

        let file_len = file.metadata()?.len();
        Ok(Self {
            path,
            fin_path,
            index,
            header,
            extra_header: Bytes::from(extra),
            chunk_size,
            compression,
            writer: None,
            write_offset: file_len,
            dirty: false,
            map: None,
            pages_touched: false,
        })
    }

    /// Segment index within the deque.
    #[must_use]
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries currently recorded.
    #[must_use]
    pub fn num_entries(&self) -> u32 {
        self.header.entry_count
    }

    /// Sum of uncompressed payload bytes across all entries.
    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        u64::from(self.header.total_bytes)
    }

    /// First tracked sequence id, or [`INVALID_ID`].
    #[must_use]
    pub fn start_id(&self) -> i64 {
        self.header.start_id
    }

    /// Last tracked sequence id, or [`INVALID_ID`].
    #[must_use]
    pub fn end_id(&self) -> i64 {
        self.header.end_id
    }

    /// Timestamp of the most recently appended entry.
    #[must_use]
    pub fn last_timestamp(&self) -> i64 {
        self.header.last_timestamp
    }

    /// The extra-header blob this segment was created with.
    #[must_use]
    pub fn extra_header(&self) -> &Bytes {
        &self.extra_header
    }

    /// True while the segment accepts offers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }

    /// True when a finality marker records a clean seal.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.fin_path.exists()
    }

    /// Offset of the first entry frame.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.header.data_start()
    }

    /// End of the entry region.
    #[must_use]
    pub fn entries_end(&self) -> u64 {
        self.write_offset
    }

    /// Usable payload capacity of an empty segment with this extra header.
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.chunk_size - self.header.data_start() as usize
    }

    /// Appends one entry.
    ///
    /// Returns [`OfferOutcome::DoesNotFit`] when the frame would exceed the
    /// segment's fixed capacity; the segment is left unchanged and the
    /// caller is expected to roll to a new segment and retry.
    ///
    /// # Errors
    ///
    /// I/O failures propagate; offering to a read-only segment is an
    /// invalid operation.
    pub fn offer(
        &mut self,
        payload: &[u8],
        ids: IdRange,
        timestamp: i64,
    ) -> PbdResult<OfferOutcome> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(PbdError::invalid_operation("offer on a read-only segment"));
        };

        let id = entry::entry_id(self.header.random_id, self.header.entry_count);
        let encoded = entry::encode_frame(payload, id, self.compression);
        let frame_len = encoded.frame.len();

        if self.write_offset + frame_len as u64 > self.chunk_size as u64 {
            return Ok(OfferOutcome::DoesNotFit { frame: frame_len });
        }

        writer.seek(SeekFrom::Start(self.write_offset))?;
        writer.write_all(&encoded.frame)?;

        self.header
            .note_entry(payload.len() as u32, ids, timestamp);
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&self.header.encode())?;

        self.write_offset += frame_len as u64;
        self.dirty = true;
        Ok(OfferOutcome::Written(frame_len))
    }

    /// Reads the entry at `at`, which must be frame-aligned and carry the
    /// given ordinal.
    ///
    /// Returns `None` when `at` is at or past the end of the entry region.
    pub fn read_entry(&mut self, at: u64, ordinal: u32) -> PbdResult<Option<DecodedEntry>> {
        if at >= self.write_offset || ordinal >= self.header.entry_count {
            return Ok(None);
        }
        let expected = entry::entry_id(self.header.random_id, ordinal);
        let end = self.write_offset as usize;
        let map = self.mapped(self.write_offset)?;
        match entry::decode_frame(&map[..end], at as usize, expected) {
            FrameCheck::Entry(e) => Ok(Some(e)),
            FrameCheck::Incomplete => Err(PbdError::corruption(
                &self.path,
                at,
                "entry region ends mid-frame",
            )),
            FrameCheck::Corrupt(detail) => Err(PbdError::corruption(&self.path, at, detail)),
        }
    }

    /// Flushes the segment to durable storage if dirty since the last sync.
    pub fn sync(&mut self) -> PbdResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_ref() {
            writer.sync_data()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Seals the segment: final flush, finality marker, read-only from
    /// here on.
    pub fn seal(&mut self) -> PbdResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
            let marker = File::create(&self.fin_path)?;
            marker.sync_all()?;
            self.dirty = false;
            debug!(segment = %self.index, "sealed segment");
        }
        Ok(())
    }

    /// Closes the mapping and deletes the backing file and its finality
    /// marker. Idempotent at the file-system level.
    pub fn close_and_delete(mut self) -> PbdResult<()> {
        self.map = None;
        self.writer = None;
        remove_if_present(&self.path)?;
        remove_if_present(&self.fin_path)?;
        debug!(segment = %self.index, "deleted segment");
        Ok(())
    }

    /// Validates the entry stream of a freshly opened segment, truncating
    /// the file at the first corrupt or incomplete frame.
    ///
    /// Finalized segments (clean seal recorded out-of-band) skip the scan.
    pub fn recover(&mut self) -> PbdResult<RecoverOutcome> {
        let expected = self.header.entry_count;
        if self.is_finalized() {
            return Ok(RecoverOutcome {
                kept: expected,
                dropped: 0,
                drop_segment: false,
            });
        }

        let data_start = self.header.data_start();
        let end = self.write_offset;
        let (kept, cut_offset, total_bytes) = self.scan_valid_prefix(data_start, end)?;

        if cut_offset == end && kept == expected {
            return Ok(RecoverOutcome {
                kept,
                dropped: 0,
                drop_segment: false,
            });
        }

        let dropped = expected.saturating_sub(kept);
        if kept == 0 {
            warn!(
                file = %self.path.display(),
                entries_lost = dropped,
                "no valid entries; dropping segment"
            );
            return Ok(RecoverOutcome {
                kept: 0,
                dropped,
                drop_segment: true,
            });
        }

        warn!(
            file = %self.path.display(),
            offset = cut_offset,
            entries_kept = kept,
            entries_lost = dropped,
            "truncating segment at first corrupt entry"
        );
        self.header.entry_count = kept;
        self.header.total_bytes = total_bytes;
        self.rewrite_and_cut(cut_offset, None)?;
        Ok(RecoverOutcome {
            kept,
            dropped,
            drop_segment: false,
        })
    }

    /// Walks valid frames in `[data_start, end)`; returns the number of
    /// valid entries, the offset just past the last valid frame, and the
    /// summed uncompressed payload bytes.
    fn scan_valid_prefix(&mut self, data_start: u64, end: u64) -> PbdResult<(u32, u64, u32)> {
        if end <= data_start {
            return Ok((0, data_start, 0));
        }
        let random_id = self.header.random_id;
        let end_usize = end as usize;
        let map = self.mapped(end)?;
        let data = &map[..end_usize];

        let mut at = data_start as usize;
        let mut ordinal = 0u32;
        let mut total_bytes = 0u32;
        while at < end_usize {
            match entry::decode_frame(data, at, entry::entry_id(random_id, ordinal)) {
                FrameCheck::Entry(e) => {
                    total_bytes += e.payload.len() as u32;
                    at += e.frame_len;
                    ordinal += 1;
                }
                FrameCheck::Incomplete | FrameCheck::Corrupt(_) => break,
            }
        }
        Ok((ordinal, at as u64, total_bytes))
    }

    /// Truncates the entry region at `cut_offset`, optionally appending a
    /// replacement frame, and persists the (caller-updated) header.
    ///
    /// `self.header` must already reflect the post-cut entry count, byte
    /// total, and ids; a replacement payload is counted on top of those.
    pub(crate) fn rewrite_and_cut(
        &mut self,
        cut_offset: u64,
        replacement: Option<(&[u8], IdRange)>,
    ) -> PbdResult<()> {
        // The map must be released before shrinking the file.
        self.map = None;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(cut_offset)?;
        self.write_offset = cut_offset;

        if let Some((payload, ids)) = replacement {
            let id = entry::entry_id(self.header.random_id, self.header.entry_count);
            let encoded = entry::encode_frame(payload, id, self.compression);
            file.seek(SeekFrom::Start(cut_offset))?;
            file.write_all(&encoded.frame)?;
            self.header
                .note_entry(payload.len() as u32, ids, self.header.last_timestamp);
            self.write_offset += encoded.frame.len() as u64;
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.encode())?;
        file.sync_all()?;
        Ok(())
    }

    /// Direct header access for controller-level id bookkeeping.
    pub(crate) fn header_mut(&mut self) -> &mut SegmentHeader {
        &mut self.header
    }

    /// Turns this segment into a quarantined stand-in, renaming the file
    /// per the quarantine convention. The file is retained for forensic
    /// recovery, never deleted here.
    pub fn quarantine(mut self, dir: &Path, nonce: &str) -> PbdResult<QuarantinedSegment> {
        self.map = None;
        self.writer = None;
        let q_path = naming::file_path(dir, nonce, self.index, true);
        fs::rename(&self.path, &q_path)?;
        remove_if_present(&self.fin_path)?;
        sync_dir(dir)?;
        warn!(
            file = %q_path.display(),
            segment = %self.index,
            entries = self.header.entry_count,
            "segment quarantined"
        );
        Ok(QuarantinedSegment::new(self.index, q_path))
    }

    /// Returns a map covering at least `need` bytes, remapping if the file
    /// has grown past the cached map.
    fn mapped(&mut self, need: u64) -> PbdResult<&Mmap> {
        let needs_remap = match self.map.as_ref() {
            Some(m) => (m.len() as u64) < need,
            None => true,
        };
        if needs_remap {
            if let Some(writer) = self.writer.as_ref() {
                // Make buffered kernel state visible through the new map.
                writer.sync_data()?;
                self.dirty = false;
            }
            let file = File::open(&self.path)?;
            // SAFETY: the file is owned by this deque process for the
            // lifetime of the map; reads are bounds-checked slices.
            #[allow(unsafe_code)]
            let map = unsafe { Mmap::map(&file)? };
            self.map = Some(map);
            self.pages_touched = false;
        }

        let Some(map) = self.map.as_ref() else {
            return Err(PbdError::invalid_operation("segment map missing after remap"));
        };
        if !self.pages_touched {
            // One-time eager page touch so first-access faults do not
            // stall the read hot path.
            let mut acc = 0u8;
            for probe in map.iter().step_by(4096) {
                acc ^= *probe;
            }
            std::hint::black_box(acc);
            self.pages_touched = true;
        }
        Ok(map)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("entries", &self.header.entry_count)
            .field("start_id", &self.header.start_id)
            .field("end_id", &self.header.end_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Removes a file, treating "not found" as success.
pub(crate) fn remove_if_present(path: &Path) -> PbdResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Fsyncs a directory so entry creations/renames/deletions are durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> PbdResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> PbdResult<()> {
    Ok(())
}
