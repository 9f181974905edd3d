//! Quarantined segments and the unified segment variant.

use super::{remove_if_present, Segment};
use crate::error::PbdResult;
use crate::types::{SegmentIndex, INVALID_ID, INVALID_TIMESTAMP};
use std::path::{Path, PathBuf};

/// A degraded, read-only stand-in for a segment whose header or entry
/// stream failed validation.
///
/// The backing file is preserved on disk (renamed with the quarantine
/// marker) for forensic recovery; the segment contributes zero entries to
/// normal traversal and supports only deletion.
#[derive(Debug)]
pub struct QuarantinedSegment {
    index: SegmentIndex,
    path: PathBuf,
}

impl QuarantinedSegment {
    /// Wraps an already-renamed quarantine file.
    #[must_use]
    pub fn new(index: SegmentIndex, path: PathBuf) -> Self {
        Self { index, path }
    }

    /// Segment index within the deque.
    #[must_use]
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    /// Path of the quarantined file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Always zero: quarantined segments hide their contents.
    #[must_use]
    pub fn num_entries(&self) -> u32 {
        0
    }

    /// Never active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        false
    }

    /// Deletes the quarantined file. The only mutation a quarantined
    /// segment supports.
    pub fn close_and_delete(self) -> PbdResult<()> {
        remove_if_present(&self.path)
    }
}

/// A segment as tracked by the deque controller: either a regular
/// (writable or read-only) segment or a quarantined one.
#[derive(Debug)]
pub enum DequeSegment {
    /// A healthy segment.
    Regular(Segment),
    /// A quarantined segment; opaque to readers.
    Quarantined(QuarantinedSegment),
}

impl DequeSegment {
    /// Segment index within the deque.
    #[must_use]
    pub fn index(&self) -> SegmentIndex {
        match self {
            Self::Regular(s) => s.index(),
            Self::Quarantined(q) => q.index(),
        }
    }

    /// Number of entries visible to readers.
    #[must_use]
    pub fn num_entries(&self) -> u32 {
        match self {
            Self::Regular(s) => s.num_entries(),
            Self::Quarantined(q) => q.num_entries(),
        }
    }

    /// Sum of uncompressed payload bytes visible to readers.
    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Self::Regular(s) => s.size_in_bytes(),
            Self::Quarantined(_) => 0,
        }
    }

    /// First tracked sequence id, or [`INVALID_ID`].
    #[must_use]
    pub fn start_id(&self) -> i64 {
        match self {
            Self::Regular(s) => s.start_id(),
            Self::Quarantined(_) => INVALID_ID,
        }
    }

    /// Last tracked sequence id, or [`INVALID_ID`].
    #[must_use]
    pub fn end_id(&self) -> i64 {
        match self {
            Self::Regular(s) => s.end_id(),
            Self::Quarantined(_) => INVALID_ID,
        }
    }

    /// Timestamp of the newest record, or [`INVALID_TIMESTAMP`].
    #[must_use]
    pub fn last_timestamp(&self) -> i64 {
        match self {
            Self::Regular(s) => s.last_timestamp(),
            Self::Quarantined(_) => INVALID_TIMESTAMP,
        }
    }

    /// True only for the regular segment currently accepting offers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match self {
            Self::Regular(s) => s.is_active(),
            Self::Quarantined(q) => q.is_active(),
        }
    }

    /// True for the quarantined variant.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        matches!(self, Self::Quarantined(_))
    }

    /// The regular segment, if this is one.
    #[must_use]
    pub fn as_regular(&self) -> Option<&Segment> {
        match self {
            Self::Regular(s) => Some(s),
            Self::Quarantined(_) => None,
        }
    }

    /// Mutable access to the regular segment, if this is one.
    pub fn as_regular_mut(&mut self) -> Option<&mut Segment> {
        match self {
            Self::Regular(s) => Some(s),
            Self::Quarantined(_) => None,
        }
    }

    /// Deletes the backing file(s) for either variant.
    pub fn close_and_delete(self) -> PbdResult<()> {
        match self {
            Self::Regular(s) => s.close_and_delete(),
            Self::Quarantined(q) => q.close_and_delete(),
        }
    }
}
