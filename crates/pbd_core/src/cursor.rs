//! Independent read cursors over a deque.
//!
//! Every consumer opens a cursor under a caller-chosen name. Cursors hold
//! only position state (segment, byte offset, entry ordinal, release
//! counts); the segments themselves stay owned by the controller, so any
//! number of cursors can traverse the same data at different speeds
//! without coordinating with each other.

use crate::deque::DequeShared;
use crate::error::PbdResult;
use crate::types::SegmentIndex;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// What `seek_to_segment` does when no segment covers the requested id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekErrorRule {
    /// Raise [`crate::PbdError::SeekNotFound`].
    Throw,
    /// Position at the lowest segment whose start id exceeds the target;
    /// not-found when the target lies beyond all data.
    SeekAfter,
    /// Position at the highest segment whose end id precedes the target;
    /// not-found when the target precedes all data.
    SeekBefore,
}

/// Per-cursor position state, owned by the controller.
#[derive(Debug)]
pub(crate) struct CursorState {
    /// Segment the cursor currently points at.
    pub segment: SegmentIndex,
    /// Byte offset of the next unread frame within that segment.
    pub offset: u64,
    /// Ordinal of the next unread entry within that segment.
    pub ordinal: u32,
    /// Uncompressed bytes consumed from the current segment.
    pub bytes_read: u64,
    /// Entries released back to the log, per segment. Capped at each
    /// segment's entry count.
    pub released: HashMap<SegmentIndex, u32>,
}

impl CursorState {
    pub(crate) fn at(segment: SegmentIndex, offset: u64) -> Self {
        Self {
            segment,
            offset,
            ordinal: 0,
            bytes_read: 0,
            released: HashMap::new(),
        }
    }

    /// Moves the cursor to the start of another segment.
    pub(crate) fn reposition(&mut self, segment: SegmentIndex, offset: u64) {
        self.segment = segment;
        self.offset = offset;
        self.ordinal = 0;
        self.bytes_read = 0;
    }

    /// Marks every entry of `segment` as released by this cursor.
    pub(crate) fn release_all(&mut self, segment: SegmentIndex, entries: u32) {
        self.released.insert(segment, entries);
    }

    /// Records one released entry, capped at the segment's entry count.
    pub(crate) fn release_one(&mut self, segment: SegmentIndex, entries: u32) {
        let slot = self.released.entry(segment).or_insert(0);
        *slot = (*slot + 1).min(entries);
    }

    /// True when this cursor no longer withholds `segment` from deletion.
    pub(crate) fn has_finished(&self, segment: SegmentIndex, entries: u32) -> bool {
        self.segment > segment && self.released.get(&segment).copied().unwrap_or(0) >= entries
    }
}

/// A named, independent read position over the deque.
///
/// Obtained from [`crate::PersistentBinaryDeque::open_for_read`]. All
/// methods are point-in-time with respect to concurrent writes.
pub struct ReadCursor {
    shared: Arc<DequeShared>,
    name: String,
}

impl ReadCursor {
    pub(crate) fn new(shared: Arc<DequeShared>, name: String) -> Self {
        Self { shared, name }
    }

    /// The caller-chosen cursor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads the next unread entry for this cursor, advancing its private
    /// position. Returns `None` when the cursor has caught up with the
    /// writer.
    pub fn poll(&self) -> PbdResult<Option<PolledEntry>> {
        self.shared.poll(&self.name, None)
    }

    /// Like [`poll`](Self::poll), but entries larger than `max_size`
    /// uncompressed bytes are left unconsumed and reported as `None`.
    pub fn poll_entry(&self, max_size: usize) -> PbdResult<Option<PolledEntry>> {
        self.shared.poll(&self.name, Some(max_size))
    }

    /// Advances the cursor past every segment whose last id is at most
    /// `id`, releasing the skipped entries. A no-op when already
    /// positioned correctly.
    pub fn skip_past(&self, id: i64) -> PbdResult<()> {
        self.shared.skip_past(&self.name, id)
    }

    /// Positions the cursor at the segment whose id range contains
    /// `entry_id`, or per `rule` when none does.
    ///
    /// # Errors
    ///
    /// [`crate::PbdError::SeekNotFound`] when the rule cannot be
    /// satisfied.
    pub fn seek_to_segment(&self, entry_id: i64, rule: SeekErrorRule) -> PbdResult<()> {
        self.shared.seek_to_segment(&self.name, entry_id, rule)
    }

    /// True when no unread entries remain for this cursor.
    pub fn is_empty(&self) -> PbdResult<bool> {
        Ok(self.num_objects()? == 0)
    }

    /// Number of unread entries ahead of this cursor.
    pub fn num_objects(&self) -> PbdResult<u64> {
        self.shared.cursor_counts(&self.name).map(|(objects, _)| objects)
    }

    /// Uncompressed bytes ahead of this cursor.
    pub fn size_in_bytes(&self) -> PbdResult<u64> {
        self.shared.cursor_counts(&self.name).map(|(_, bytes)| bytes)
    }

    /// True while the cursor is registered with an open deque.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.cursor_is_open(&self.name)
    }

    /// Unregisters the cursor. Segments it was withholding become
    /// eligible for deletion by the remaining cursors.
    pub fn close(self) -> PbdResult<()> {
        self.shared.close_cursor(&self.name)
    }
}

impl std::fmt::Debug for ReadCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCursor").field("name", &self.name).finish()
    }
}

/// One entry handed out by [`ReadCursor::poll`].
///
/// The payload is owned; its lifetime is independent of the segment it
/// was read from. Consuming the handle decides the entry's fate:
/// [`release`](Self::release) counts it toward segment-deletion
/// eligibility, [`free`](Self::free) (or a plain drop) gives the buffer
/// back without affecting deletion, for data that must be re-read later.
/// Move semantics make releasing the same entry twice impossible.
#[must_use = "release() or free() decides whether the entry counts toward segment deletion"]
pub struct PolledEntry {
    pub(crate) payload: Bytes,
    pub(crate) segment: SegmentIndex,
    pub(crate) cursor: String,
    pub(crate) shared: Arc<DequeShared>,
}

impl PolledEntry {
    /// The entry's uncompressed payload.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.payload
    }

    /// Uncompressed payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for a zero-length payload (never produced by a well-formed
    /// deque, but kept for completeness of the container API).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Releases the entry back to the log, counting it toward the
    /// "all cursors done with this segment" deletion condition.
    pub fn release(self) -> PbdResult<()> {
        self.shared.release_entry(&self.cursor, self.segment)
    }

    /// Frees the buffer without releasing the entry; the segment stays
    /// pinned for this cursor until the data is re-read and released.
    pub fn free(self) {}
}

impl std::ops::Deref for PolledEntry {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.payload
    }
}

impl std::fmt::Debug for PolledEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledEntry")
            .field("segment", &self.segment)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
