//! The deque controller: one directory of segment files, one writer,
//! many named cursors.
//!
//! All shared state lives behind a single mutex inside [`DequeShared`];
//! cursors and polled entries hold an `Arc` to it, so the controller's
//! lifetime outlasts every handle it has given out. Segment files are
//! deleted only when every open cursor has both moved past a segment and
//! released all of its entries.

use crate::config::{DequeConfig, RetentionConfig};
use crate::cursor::{CursorState, PolledEntry, ReadCursor, SeekErrorRule};
use crate::error::{PbdError, PbdResult};
use crate::naming::{self, ParsedFileName};
use crate::retention::{RetentionRuntime, RetentionScheduler, RETENTION_CURSOR};
use crate::segment::{
    remove_if_present, sync_dir, DequeSegment, OfferOutcome, QuarantinedSegment, Segment,
    ENTRY_HEADER_BYTES, SEGMENT_HEADER_BYTES,
};
use crate::types::{now_millis, IdRange, SegmentIndex, INVALID_ID, INVALID_TIMESTAMP};
use bytes::Bytes;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verdict returned by a truncation callback for one entry.
#[derive(Debug)]
pub enum TruncatorResponse {
    /// Keep the entry as-is; `end_id` is the last sequence id it covers
    /// (or [`INVALID_ID`] for untracked deques).
    Keep {
        /// Last sequence id covered by the kept entry.
        end_id: i64,
    },
    /// Replace the entry with a trimmed payload and cut everything after
    /// it.
    Partial {
        /// The trimmed payload that stands in for the original entry.
        payload: Bytes,
        /// Last sequence id covered by the trimmed payload.
        end_id: i64,
    },
    /// Cut at this entry: drop it and everything after it.
    Truncate,
}

/// Why a truncation pass cut the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateCause {
    /// An entry failed CRC or structural validation.
    Corruption,
    /// The truncation callback requested the cut.
    Truncator,
}

/// Outcome of [`PersistentBinaryDeque::parse_and_truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateReport {
    /// Entries that survived the pass, across all segments.
    pub entries_kept: u64,
    /// Entries removed by the cut.
    pub entries_dropped: u64,
    /// What caused the cut, or `None` when nothing was cut.
    pub cause: Option<TruncateCause>,
}

/// Builder for opening (or creating) a deque in a directory.
pub struct DequeBuilder {
    nonce: String,
    dir: PathBuf,
    config: DequeConfig,
    extra_header: Option<Bytes>,
    retention: Option<(RetentionConfig, Arc<RetentionScheduler>)>,
}

impl DequeBuilder {
    /// Sets the deque configuration.
    #[must_use]
    pub fn config(mut self, config: DequeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the extra-header blob stamped into new segments. When opening
    /// an existing deque without this, the newest recovered segment's
    /// blob is carried forward.
    #[must_use]
    pub fn initial_extra_header(mut self, blob: impl Into<Bytes>) -> Self {
        self.extra_header = Some(blob.into());
        self
    }

    /// Enables time-based retention, run on the given shared scheduler.
    #[must_use]
    pub fn retain(mut self, config: RetentionConfig, scheduler: Arc<RetentionScheduler>) -> Self {
        self.retention = Some((config, scheduler));
        self
    }

    /// Opens the deque, recovering any existing segment files in the
    /// directory.
    ///
    /// # Errors
    ///
    /// [`PbdError::DirectoryLocked`] when another deque instance holds the
    /// directory; [`PbdError::InvalidConfig`] for a rejected
    /// configuration; I/O and corruption errors from recovery.
    pub fn open(self) -> PbdResult<PersistentBinaryDeque> {
        DequeShared::open(self)
    }
}

/// Per-deque state guarded by the controller mutex.
struct DequeState {
    segments: BTreeMap<SegmentIndex, DequeSegment>,
    active: SegmentIndex,
    extra_header: Bytes,
    cursors: HashMap<String, CursorState>,
    /// `Some(true)` once a tracked entry is stored, `Some(false)` once an
    /// untracked one is; the two never mix.
    tracks_ids: Option<bool>,
    /// Highest sequence id stored so far, or [`INVALID_ID`].
    prev_end_id: i64,
    closed: bool,
}

impl DequeState {
    fn oldest_position(&self) -> (SegmentIndex, u64) {
        match self.segments.iter().next() {
            Some((idx, DequeSegment::Regular(s))) => (*idx, s.data_start()),
            Some((idx, _)) => (*idx, 0),
            None => (self.active, 0),
        }
    }
}

/// Position of the first segment after `after`, if any.
fn next_position(
    segments: &BTreeMap<SegmentIndex, DequeSegment>,
    after: SegmentIndex,
) -> Option<(SegmentIndex, u64)> {
    segments
        .range((Bound::Excluded(after), Bound::Unbounded))
        .next()
        .map(|(idx, seg)| {
            let offset = match seg {
                DequeSegment::Regular(s) => s.data_start(),
                DequeSegment::Quarantined(_) => 0,
            };
            (*idx, offset)
        })
}

fn active_regular(st: &mut DequeState) -> PbdResult<&mut Segment> {
    let active = st.active;
    st.segments
        .get_mut(&active)
        .and_then(DequeSegment::as_regular_mut)
        .ok_or_else(|| PbdError::invalid_operation("active segment missing"))
}

/// Deletes every non-active segment that all open cursors have moved past
/// and fully released.
fn reap(st: &mut DequeState) -> PbdResult<()> {
    if st.cursors.is_empty() {
        return Ok(());
    }
    let candidates: Vec<SegmentIndex> = st
        .segments
        .iter()
        .filter(|(idx, seg)| {
            **idx != st.active && !seg.is_active() && {
                let entries = seg.num_entries();
                st.cursors.values().all(|c| c.has_finished(**idx, entries))
            }
        })
        .map(|(idx, _)| *idx)
        .collect();
    for idx in candidates {
        if let Some(seg) = st.segments.remove(&idx) {
            debug!(segment = %idx, "deleting fully consumed segment");
            seg.close_and_delete()?;
        }
        for cursor in st.cursors.values_mut() {
            cursor.released.remove(&idx);
        }
    }
    Ok(())
}

fn derive_id_tracking(segments: &BTreeMap<SegmentIndex, DequeSegment>) -> (Option<bool>, i64) {
    let mut tracks = None;
    let mut prev_end = INVALID_ID;
    for seg in segments.values() {
        if seg.num_entries() == 0 || seg.is_quarantined() {
            continue;
        }
        if seg.end_id() == INVALID_ID {
            tracks.get_or_insert(false);
        } else {
            tracks = Some(true);
            prev_end = prev_end.max(seg.end_id());
        }
    }
    (tracks, prev_end)
}

/// Renames a segment file per the quarantine convention without opening
/// it. Used when the header itself is unreadable.
fn quarantine_file(dir: &Path, nonce: &str, index: SegmentIndex) -> PbdResult<QuarantinedSegment> {
    let from = naming::file_path(dir, nonce, index, false);
    let to = naming::file_path(dir, nonce, index, true);
    fs::rename(&from, &to)?;
    remove_if_present(&naming::finality_marker_path(dir, nonce, index))?;
    sync_dir(dir)?;
    warn!(file = %to.display(), segment = %index, "segment with unreadable header quarantined");
    Ok(QuarantinedSegment::new(index, to))
}

/// The state shared between the deque handle, its cursors, and its
/// polled entries.
pub(crate) struct DequeShared {
    nonce: String,
    dir: PathBuf,
    config: DequeConfig,
    lock_path: PathBuf,
    _dir_lock: File,
    retention: Option<RetentionRuntime>,
    state: Mutex<DequeState>,
}

impl DequeShared {
    fn open(builder: DequeBuilder) -> PbdResult<PersistentBinaryDeque> {
        let DequeBuilder {
            nonce,
            dir,
            config,
            extra_header,
            retention,
        } = builder;

        fs::create_dir_all(&dir)?;
        let lock_path = dir.join(format!(".{nonce}.lock"));
        let dir_lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        dir_lock
            .try_lock_exclusive()
            .map_err(|_| PbdError::DirectoryLocked)?;

        let mut segments: BTreeMap<SegmentIndex, DequeSegment> = BTreeMap::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let (file_nonce, index, quarantined) = match naming::parse(&name) {
                ParsedFileName::Ok {
                    nonce,
                    index,
                    quarantined,
                } => (nonce, index, quarantined),
                ParsedFileName::InvalidName => {
                    warn!(file = %name, "ignoring malformed segment file name");
                    continue;
                }
                ParsedFileName::NotALogFile => continue,
            };
            if file_nonce != nonce {
                continue;
            }
            if quarantined {
                segments.insert(
                    index,
                    DequeSegment::Quarantined(QuarantinedSegment::new(index, dir_entry.path())),
                );
                continue;
            }
            match Segment::open_for_read(&dir, &nonce, index, config.chunk_size, config.compression)
            {
                Ok(mut seg) => {
                    let outcome = seg.recover()?;
                    if outcome.drop_segment {
                        seg.close_and_delete()?;
                    } else {
                        segments.insert(index, DequeSegment::Regular(seg));
                    }
                }
                Err(PbdError::Corruption { .. }) => {
                    let q = quarantine_file(&dir, &nonce, index)?;
                    segments.insert(index, DequeSegment::Quarantined(q));
                }
                Err(other) => return Err(other),
            }
        }

        // Seal whatever was active before the crash or close; a fresh
        // active segment always starts the new session.
        let extra_header = extra_header
            .or_else(|| {
                segments
                    .values()
                    .rev()
                    .find_map(|s| s.as_regular().map(|r| r.extra_header().clone()))
            })
            .unwrap_or_default();
        config.validate(extra_header.len())?;

        let active = segments
            .keys()
            .next_back()
            .map_or(SegmentIndex::new(1), |max| max.next());
        let seg = Segment::create(
            &dir,
            &nonce,
            active,
            &extra_header,
            config.chunk_size,
            config.compression,
        )?;
        segments.insert(active, DequeSegment::Regular(seg));

        let (tracks_ids, prev_end_id) = derive_id_tracking(&segments);
        info!(
            nonce,
            dir = %dir.display(),
            segments = segments.len(),
            "opened persistent binary deque"
        );

        let mut state = DequeState {
            segments,
            active,
            extra_header,
            cursors: HashMap::new(),
            tracks_ids,
            prev_end_id,
            closed: false,
        };
        if retention.is_some() {
            let (oldest, offset) = state.oldest_position();
            state
                .cursors
                .insert(RETENTION_CURSOR.to_string(), CursorState::at(oldest, offset));
        }

        let shared = Arc::new(Self {
            nonce,
            dir,
            config,
            lock_path,
            _dir_lock: dir_lock,
            retention: retention.map(|(config, scheduler)| RetentionRuntime { config, scheduler }),
            state: Mutex::new(state),
        });
        shared.schedule_retention_check(Duration::ZERO);
        Ok(PersistentBinaryDeque { shared })
    }

    fn offer(self: &Arc<Self>, payload: &[u8], ids: IdRange) -> PbdResult<usize> {
        let mut rolled = false;
        let written = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PbdError::Closed);
            }
            if payload.is_empty() {
                return Err(PbdError::invalid_operation("cannot offer an empty payload"));
            }
            let st = &mut *state;

            if ids.is_untracked() {
                if st.tracks_ids == Some(true) {
                    return Err(PbdError::invalid_ids(
                        "untracked entry offered to an id-tracked log",
                    ));
                }
            } else {
                if st.tracks_ids == Some(false) {
                    return Err(PbdError::invalid_ids(
                        "id-tracked entry offered to an untracked log",
                    ));
                }
                if ids.start < 0 || ids.end < ids.start {
                    return Err(PbdError::invalid_ids(format!(
                        "id range [{}, {}] is not a valid ascending range",
                        ids.start, ids.end
                    )));
                }
                if st.prev_end_id != INVALID_ID && ids.start <= st.prev_end_id {
                    return Err(PbdError::invalid_ids(format!(
                        "start id {} does not follow last stored id {}",
                        ids.start, st.prev_end_id
                    )));
                }
            }

            let capacity = self
                .config
                .chunk_size
                .saturating_sub(SEGMENT_HEADER_BYTES + st.extra_header.len());
            let timestamp = now_millis();
            let written = match active_regular(st)?.offer(payload, ids, timestamp)? {
                OfferOutcome::Written(n) => n,
                OfferOutcome::DoesNotFit { frame } => {
                    // A frame no empty segment could hold fails before
                    // any segment is rolled.
                    if frame > capacity {
                        return Err(PbdError::EntryTooLarge {
                            size: frame,
                            capacity,
                        });
                    }
                    self.roll_active(st)?;
                    rolled = true;
                    match active_regular(st)?.offer(payload, ids, timestamp)? {
                        OfferOutcome::Written(n) => n,
                        OfferOutcome::DoesNotFit { frame } => {
                            return Err(PbdError::EntryTooLarge {
                                size: frame,
                                capacity,
                            })
                        }
                    }
                }
            };
            if self.config.sync_on_offer {
                active_regular(st)?.sync()?;
            }

            if ids.is_untracked() {
                st.tracks_ids = Some(false);
            } else {
                st.tracks_ids = Some(true);
                st.prev_end_id = ids.end;
            }
            written
        };
        if rolled {
            self.schedule_retention_check(Duration::ZERO);
        }
        Ok(written)
    }

    /// Seals the active segment and starts the next one.
    fn roll_active(&self, st: &mut DequeState) -> PbdResult<()> {
        active_regular(st)?.seal()?;
        let next = st.active.next();
        let seg = Segment::create(
            &self.dir,
            &self.nonce,
            next,
            &st.extra_header,
            self.config.chunk_size,
            self.config.compression,
        )?;
        st.segments.insert(next, DequeSegment::Regular(seg));
        st.active = next;
        Ok(())
    }

    fn update_extra_header(self: &Arc<Self>, blob: Bytes) -> PbdResult<()> {
        let rolled;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PbdError::Closed);
            }
            self.config.validate(blob.len())?;
            let st = &mut *state;
            st.extra_header = blob;
            if active_regular(st)?.num_entries() == 0 {
                // Nothing written yet: replace the empty active segment
                // in place instead of leaving an empty file behind.
                let active = st.active;
                if let Some(seg) = st.segments.remove(&active) {
                    seg.close_and_delete()?;
                }
                let seg = Segment::create(
                    &self.dir,
                    &self.nonce,
                    active,
                    &st.extra_header,
                    self.config.chunk_size,
                    self.config.compression,
                )?;
                let data_start = seg.data_start();
                st.segments.insert(active, DequeSegment::Regular(seg));
                // The new blob may differ in size, moving the entry
                // region; cursors parked on the replaced segment must
                // pick up the new data start.
                for cursor in st.cursors.values_mut() {
                    if cursor.segment == active {
                        cursor.reposition(active, data_start);
                    }
                }
                rolled = false;
            } else {
                self.roll_active(st)?;
                rolled = true;
            }
        }
        if rolled {
            self.schedule_retention_check(Duration::ZERO);
        }
        Ok(())
    }

    /// Writes a batch of entries in front of everything already stored.
    ///
    /// Entries are grouped into freshly created, immediately sealed
    /// segments numbered downward from the current oldest segment, so
    /// they read back in batch order ahead of all existing data.
    fn push(&self, entries: &[(Bytes, IdRange)]) -> PbdResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let st = &mut *state;
        if st.cursors.keys().any(|k| k != RETENTION_CURSOR) {
            return Err(PbdError::invalid_operation(
                "cannot push while read cursors are open",
            ));
        }

        let tracked = !entries[0].1.is_untracked();
        let mut batch_end = INVALID_ID;
        for (payload, ids) in entries {
            if payload.is_empty() {
                return Err(PbdError::invalid_operation("cannot push an empty payload"));
            }
            if ids.is_untracked() == tracked {
                return Err(PbdError::invalid_ids(
                    "pushed batch mixes tracked and untracked entries",
                ));
            }
            if tracked {
                if ids.start < 0 || ids.end < ids.start {
                    return Err(PbdError::invalid_ids(format!(
                        "id range [{}, {}] is not a valid ascending range",
                        ids.start, ids.end
                    )));
                }
                if batch_end != INVALID_ID && ids.start <= batch_end {
                    return Err(PbdError::invalid_ids(format!(
                        "start id {} does not follow pushed id {}",
                        ids.start, batch_end
                    )));
                }
                batch_end = ids.end;
            }
        }
        if tracked {
            if st.tracks_ids == Some(false) {
                return Err(PbdError::invalid_ids(
                    "id-tracked entries pushed into an untracked log",
                ));
            }
            let first_stored = st
                .segments
                .values()
                .map(DequeSegment::start_id)
                .find(|id| *id != INVALID_ID);
            if let Some(first) = first_stored {
                if batch_end >= first {
                    return Err(PbdError::invalid_ids(format!(
                        "pushed id {batch_end} does not precede oldest stored id {first}"
                    )));
                }
            }
        } else if st.tracks_ids == Some(true) {
            return Err(PbdError::invalid_ids(
                "untracked entries pushed into an id-tracked log",
            ));
        }

        // Group by uncompressed frame size; compressed frames are never
        // larger, so every group fits its segment.
        let capacity = self
            .config
            .chunk_size
            .saturating_sub(SEGMENT_HEADER_BYTES + st.extra_header.len());
        let mut groups: Vec<std::ops::Range<usize>> = Vec::new();
        let mut group_start = 0usize;
        let mut used = 0usize;
        for (i, (payload, _)) in entries.iter().enumerate() {
            let frame = ENTRY_HEADER_BYTES + payload.len();
            if !self.config.compression && frame > capacity {
                return Err(PbdError::EntryTooLarge {
                    size: frame,
                    capacity,
                });
            }
            if used > 0 && used + frame > capacity {
                groups.push(group_start..i);
                group_start = i;
                used = 0;
            }
            used += frame;
        }
        groups.push(group_start..entries.len());

        let oldest = st.segments.keys().next().copied().unwrap_or(st.active);
        if oldest.as_u64() < groups.len() as u64 {
            return Err(PbdError::invalid_operation(
                "no segment index space left in front of the deque",
            ));
        }

        let total = groups.len() as u64;
        let mut created: Vec<SegmentIndex> = Vec::with_capacity(groups.len());
        for (n, group) in groups.into_iter().enumerate() {
            let index = SegmentIndex::new(oldest.as_u64() - (total - n as u64));
            let mut seg = Segment::create(
                &self.dir,
                &self.nonce,
                index,
                &st.extra_header,
                self.config.chunk_size,
                self.config.compression,
            )?;
            for (payload, ids) in &entries[group] {
                match seg.offer(payload, *ids, now_millis())? {
                    OfferOutcome::Written(_) => {}
                    OfferOutcome::DoesNotFit { frame } => {
                        seg.close_and_delete()?;
                        for idx in &created {
                            if let Some(s) = st.segments.remove(idx) {
                                s.close_and_delete()?;
                            }
                        }
                        return Err(PbdError::EntryTooLarge {
                            size: frame,
                            capacity,
                        });
                    }
                }
            }
            seg.seal()?;
            st.segments.insert(index, DequeSegment::Regular(seg));
            created.push(index);
        }

        st.tracks_ids = Some(tracked);
        if tracked && st.prev_end_id == INVALID_ID {
            st.prev_end_id = batch_end;
        }
        // The retention cursor starts over from the new front.
        let (front, offset) = st.oldest_position();
        if let Some(c) = st.cursors.get_mut(RETENTION_CURSOR) {
            c.reposition(front, offset);
        }
        debug!(entries = entries.len(), "pushed entries at the front");
        Ok(())
    }

    pub(crate) fn open_cursor(self: &Arc<Self>, name: &str) -> PbdResult<ReadCursor> {
        if name == RETENTION_CURSOR {
            return Err(PbdError::invalid_operation(format!(
                "cursor name {RETENTION_CURSOR} is reserved"
            )));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        if !state.cursors.contains_key(name) {
            let (oldest, offset) = state.oldest_position();
            state
                .cursors
                .insert(name.to_string(), CursorState::at(oldest, offset));
        }
        Ok(ReadCursor::new(Arc::clone(self), name.to_string()))
    }

    pub(crate) fn close_cursor(&self, name: &str) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if state.cursors.remove(name).is_some() {
            reap(&mut state)?;
        }
        Ok(())
    }

    pub(crate) fn cursor_is_open(&self, name: &str) -> bool {
        let state = self.state.lock();
        !state.closed && state.cursors.contains_key(name)
    }

    pub(crate) fn poll(
        self: &Arc<Self>,
        cursor: &str,
        max_size: Option<usize>,
    ) -> PbdResult<Option<PolledEntry>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let st = &mut *state;
        loop {
            let (cur_seg, offset, ordinal) = {
                let c = cursor_state(st, cursor)?;
                (c.segment, c.offset, c.ordinal)
            };
            let readable = match st.segments.get(&cur_seg) {
                Some(DequeSegment::Regular(seg)) if ordinal < seg.num_entries() => true,
                Some(DequeSegment::Regular(seg)) if seg.is_active() => return Ok(None),
                _ => false,
            };

            if !readable {
                let Some((next, next_offset)) = next_position(&st.segments, cur_seg) else {
                    return Ok(None);
                };
                cursor_state_mut(st, cursor)?.reposition(next, next_offset);
                // Moving past a fully released segment may make it
                // deletable right now.
                reap(st)?;
                continue;
            }

            let Some(DequeSegment::Regular(seg)) = st.segments.get_mut(&cur_seg) else {
                return Ok(None);
            };
            let Some(entry) = seg.read_entry(offset, ordinal)? else {
                return Ok(None);
            };
            if max_size.is_some_and(|max| entry.payload.len() > max) {
                return Ok(None);
            }
            let c = cursor_state_mut(st, cursor)?;
            c.offset += entry.frame_len as u64;
            c.ordinal += 1;
            c.bytes_read += entry.payload.len() as u64;
            return Ok(Some(PolledEntry {
                payload: entry.payload,
                segment: cur_seg,
                cursor: cursor.to_string(),
                shared: Arc::clone(self),
            }));
        }
    }

    pub(crate) fn release_entry(&self, cursor: &str, segment: SegmentIndex) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let Some(entries) = state.segments.get(&segment).map(DequeSegment::num_entries) else {
            return Ok(());
        };
        if let Some(c) = state.cursors.get_mut(cursor) {
            c.release_one(segment, entries);
        }
        reap(&mut state)
    }

    pub(crate) fn skip_past(&self, cursor: &str, id: i64) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let st = &mut *state;
        loop {
            let cur_seg = cursor_state(st, cursor)?.segment;
            let Some(seg) = st.segments.get(&cur_seg) else {
                let Some((next, next_offset)) = next_position(&st.segments, cur_seg) else {
                    break;
                };
                cursor_state_mut(st, cursor)?.reposition(next, next_offset);
                continue;
            };
            let end = seg.end_id();
            if end == INVALID_ID || end > id {
                break;
            }
            let entries = seg.num_entries();
            let active = seg.is_active();
            let entries_end = seg.as_regular().map(Segment::entries_end);
            match next_position(&st.segments, cur_seg) {
                Some((next, next_offset)) if !active => {
                    let c = cursor_state_mut(st, cursor)?;
                    c.release_all(cur_seg, entries);
                    c.reposition(next, next_offset);
                }
                _ => {
                    // Skipping within the newest segment: park at its end.
                    if let Some(entries_end) = entries_end {
                        let c = cursor_state_mut(st, cursor)?;
                        c.release_all(cur_seg, entries);
                        c.offset = entries_end;
                        c.ordinal = entries;
                    }
                    break;
                }
            }
        }
        reap(st)
    }

    pub(crate) fn seek_to_segment(
        &self,
        cursor: &str,
        id: i64,
        rule: SeekErrorRule,
    ) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let st = &mut *state;
        cursor_state(st, cursor)?;

        let mut containing = None;
        let mut after = None;
        let mut before = None;
        for (idx, seg) in &st.segments {
            let (start, end) = (seg.start_id(), seg.end_id());
            if start == INVALID_ID {
                // Quarantined, empty, and untracked segments are holes in
                // the id space.
                continue;
            }
            if start <= id && id <= end {
                containing = Some(*idx);
                break;
            }
            if start > id && after.is_none() {
                after = Some(*idx);
            }
            if end < id {
                before = Some(*idx);
            }
        }

        let fallback = match rule {
            SeekErrorRule::Throw => None,
            SeekErrorRule::SeekAfter => after,
            SeekErrorRule::SeekBefore => before,
        };
        let target = containing
            .or(fallback)
            .ok_or(PbdError::SeekNotFound { id })?;
        let offset = st
            .segments
            .get(&target)
            .and_then(DequeSegment::as_regular)
            .map(Segment::data_start)
            .ok_or(PbdError::SeekNotFound { id })?;
        cursor_state_mut(st, cursor)?.reposition(target, offset);
        Ok(())
    }

    pub(crate) fn cursor_counts(&self, cursor: &str) -> PbdResult<(u64, u64)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let st = &mut *state;
        let (cur_seg, ordinal, bytes_read) = {
            let c = cursor_state(st, cursor)?;
            (c.segment, c.ordinal, c.bytes_read)
        };
        let mut objects = 0u64;
        let mut bytes = 0u64;
        for (idx, seg) in st.segments.range(cur_seg..) {
            if *idx == cur_seg {
                objects += u64::from(seg.num_entries().saturating_sub(ordinal));
                bytes += seg.size_in_bytes().saturating_sub(bytes_read);
            } else {
                objects += u64::from(seg.num_entries());
                bytes += seg.size_in_bytes();
            }
        }
        Ok((objects, bytes))
    }

    fn quarantine_segment(&self, index: SegmentIndex) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        if index == state.active {
            return Err(PbdError::invalid_operation(
                "cannot quarantine the active segment",
            ));
        }
        let Some(seg) = state.segments.remove(&index) else {
            return Err(PbdError::invalid_operation(format!(
                "no segment at {index}"
            )));
        };
        let quarantined = match seg {
            DequeSegment::Regular(s) => s.quarantine(&self.dir, &self.nonce)?,
            DequeSegment::Quarantined(q) => q,
        };
        state
            .segments
            .insert(index, DequeSegment::Quarantined(quarantined));
        reap(&mut state)
    }

    fn parse_and_truncate(
        &self,
        truncator: &mut dyn FnMut(&[u8]) -> TruncatorResponse,
    ) -> PbdResult<TruncateReport> {
        struct CutPlan {
            offset: u64,
            kept: u32,
            prefix_bytes: u32,
            last_keep_end: i64,
            replacement: Option<(Bytes, i64)>,
            cause: TruncateCause,
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        if state.cursors.keys().any(|k| k != RETENTION_CURSOR) {
            return Err(PbdError::invalid_operation(
                "cannot truncate while read cursors are open",
            ));
        }
        let active_entries = state
            .segments
            .get(&state.active)
            .map_or(0, DequeSegment::num_entries);
        if active_entries != 0 {
            return Err(PbdError::invalid_operation(
                "truncation must run before entries are offered",
            ));
        }

        let old_max = state.active;
        let indexes: Vec<SegmentIndex> = state.segments.keys().copied().collect();
        let mut kept_total = 0u64;
        let mut cut: Option<(SegmentIndex, CutPlan)> = None;

        'segments: for idx in indexes {
            if idx == state.active {
                continue;
            }
            let st = &mut *state;
            let Some(seg) = st.segments.get_mut(&idx).and_then(DequeSegment::as_regular_mut)
            else {
                continue;
            };
            let entries = seg.num_entries();
            let mut offset = seg.data_start();
            let mut prefix_bytes = 0u32;
            let mut last_keep_end = INVALID_ID;
            for ordinal in 0..entries {
                let entry = match seg.read_entry(offset, ordinal) {
                    Ok(Some(e)) => e,
                    Ok(None) => break,
                    Err(PbdError::Corruption { .. }) => {
                        cut = Some((
                            idx,
                            CutPlan {
                                offset,
                                kept: ordinal,
                                prefix_bytes,
                                last_keep_end,
                                replacement: None,
                                cause: TruncateCause::Corruption,
                            },
                        ));
                        break 'segments;
                    }
                    Err(e) => return Err(e),
                };
                match truncator(&entry.payload) {
                    TruncatorResponse::Keep { end_id } => {
                        kept_total += 1;
                        if end_id != INVALID_ID {
                            last_keep_end = end_id;
                        }
                        prefix_bytes += entry.payload.len() as u32;
                        offset += entry.frame_len as u64;
                    }
                    TruncatorResponse::Partial { payload, end_id } => {
                        kept_total += 1;
                        cut = Some((
                            idx,
                            CutPlan {
                                offset,
                                kept: ordinal,
                                prefix_bytes,
                                last_keep_end,
                                replacement: Some((payload, end_id)),
                                cause: TruncateCause::Truncator,
                            },
                        ));
                        break 'segments;
                    }
                    TruncatorResponse::Truncate => {
                        cut = Some((
                            idx,
                            CutPlan {
                                offset,
                                kept: ordinal,
                                prefix_bytes,
                                last_keep_end,
                                replacement: None,
                                cause: TruncateCause::Truncator,
                            },
                        ));
                        break 'segments;
                    }
                }
            }
        }

        let Some((cut_idx, plan)) = cut else {
            return Ok(TruncateReport {
                entries_kept: kept_total,
                entries_dropped: 0,
                cause: None,
            });
        };

        let st = &mut *state;
        let mut dropped = 0u64;
        {
            let seg = st
                .segments
                .get_mut(&cut_idx)
                .and_then(DequeSegment::as_regular_mut)
                .ok_or_else(|| PbdError::invalid_operation("cut segment vanished"))?;
            dropped += u64::from(seg.num_entries() - plan.kept);
            if plan.replacement.is_some() {
                // The cut entry partially survives as the replacement.
                dropped = dropped.saturating_sub(1);
            }
            let header = seg.header_mut();
            header.entry_count = plan.kept;
            header.total_bytes = plan.prefix_bytes;
            if plan.kept == 0 {
                header.start_id = INVALID_ID;
                header.end_id = INVALID_ID;
            } else if plan.last_keep_end != INVALID_ID {
                header.end_id = plan.last_keep_end;
            }
            let replacement = plan.replacement.as_ref().map(|(payload, end_id)| {
                let ids = if *end_id == INVALID_ID {
                    IdRange::UNTRACKED
                } else {
                    IdRange::new(*end_id, *end_id)
                };
                (&payload[..], ids)
            });
            seg.rewrite_and_cut(plan.offset, replacement)?;
        }

        let later = st.segments.split_off(&cut_idx.next());
        for (_, seg) in later {
            dropped += u64::from(seg.num_entries());
            seg.close_and_delete()?;
        }
        if plan.kept == 0 && plan.replacement.is_none() {
            if let Some(seg) = st.segments.remove(&cut_idx) {
                seg.close_and_delete()?;
            }
        }

        let new_active = old_max.next();
        let seg = Segment::create(
            &self.dir,
            &self.nonce,
            new_active,
            &st.extra_header,
            self.config.chunk_size,
            self.config.compression,
        )?;
        st.segments.insert(new_active, DequeSegment::Regular(seg));
        st.active = new_active;

        let (tracks_ids, prev_end_id) = derive_id_tracking(&st.segments);
        st.tracks_ids = tracks_ids;
        st.prev_end_id = prev_end_id;

        let (oldest, offset) = st.oldest_position();
        for cursor in st.cursors.values_mut() {
            cursor.reposition(oldest, offset);
            cursor.released.clear();
        }

        info!(
            kept = kept_total,
            dropped,
            cause = ?plan.cause,
            "log truncated"
        );
        Ok(TruncateReport {
            entries_kept: kept_total,
            entries_dropped: dropped,
            cause: Some(plan.cause),
        })
    }

    fn sync(&self) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        active_regular(&mut state)?.sync()
    }

    pub(crate) fn close(&self) -> PbdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let st = &mut *state;
        if let Some(seg) = st
            .segments
            .get_mut(&st.active)
            .and_then(DequeSegment::as_regular_mut)
        {
            seg.seal()?;
        }
        st.closed = true;
        debug!(nonce = %self.nonce, "closed deque");
        Ok(())
    }

    fn schedule_retention_check(self: &Arc<Self>, delay: Duration) {
        let Some(rt) = &self.retention else {
            return;
        };
        let weak = Arc::downgrade(self);
        rt.scheduler.schedule(
            &self.nonce,
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    if let Err(e) = shared.run_retention_check() {
                        warn!(error = %e, "retention check failed");
                    }
                }
            }),
        );
    }

    /// Deletes aged-out segments from the oldest end, then reschedules
    /// itself for the next segment's deadline.
    fn run_retention_check(self: &Arc<Self>) -> PbdResult<()> {
        let Some(rt) = &self.retention else {
            return Ok(());
        };
        let window = rt.config.window;
        let min_delay = rt.config.min_recheck_delay;
        let mut reschedule = None;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            let st = &mut *state;
            loop {
                let Some(cur) = st.cursors.get(RETENTION_CURSOR) else {
                    return Ok(());
                };
                let cur_seg = cur.segment;
                let Some(seg) = st.segments.get(&cur_seg) else {
                    let Some((next, next_offset)) = next_position(&st.segments, cur_seg) else {
                        break;
                    };
                    cursor_state_mut(st, RETENTION_CURSOR)?.reposition(next, next_offset);
                    continue;
                };
                if seg.is_active() {
                    break;
                }
                let aged = match seg.last_timestamp() {
                    // Only a segment that never stored an entry lacks a
                    // timestamp; it holds nothing worth retaining.
                    INVALID_TIMESTAMP => true,
                    ts => {
                        let age = now_millis().saturating_sub(ts).max(0) as u64;
                        if u128::from(age) >= window.as_millis() {
                            true
                        } else {
                            let remaining = window - Duration::from_millis(age);
                            reschedule = Some(remaining.max(min_delay));
                            false
                        }
                    }
                };
                if !aged {
                    break;
                }
                let entries = seg.num_entries();
                let Some((next, next_offset)) = next_position(&st.segments, cur_seg) else {
                    break;
                };
                debug!(segment = %cur_seg, "segment aged out of the retention window");
                let c = cursor_state_mut(st, RETENTION_CURSOR)?;
                c.release_all(cur_seg, entries);
                c.reposition(next, next_offset);
                reap(st)?;
            }
        }
        if let Some(delay) = reschedule {
            self.schedule_retention_check(delay);
        }
        Ok(())
    }

    fn stats(&self) -> PbdResult<DequeStats> {
        let state = self.state.lock();
        if state.closed {
            return Err(PbdError::Closed);
        }
        let mut stats = DequeStats {
            segments: state.segments.len(),
            entries: 0,
            size_in_bytes: 0,
        };
        for seg in state.segments.values() {
            stats.entries += u64::from(seg.num_entries());
            stats.size_in_bytes += seg.size_in_bytes();
        }
        Ok(stats)
    }
}

fn cursor_state<'a>(st: &'a DequeState, name: &str) -> PbdResult<&'a CursorState> {
    st.cursors
        .get(name)
        .ok_or_else(|| PbdError::invalid_operation(format!("cursor {name} is not open")))
}

fn cursor_state_mut<'a>(st: &'a mut DequeState, name: &str) -> PbdResult<&'a mut CursorState> {
    st.cursors
        .get_mut(name)
        .ok_or_else(|| PbdError::invalid_operation(format!("cursor {name} is not open")))
}

/// Point-in-time totals across all segments of a deque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeStats {
    /// Number of segment files, the active one included.
    pub segments: usize,
    /// Entries visible to readers.
    pub entries: u64,
    /// Sum of uncompressed payload bytes.
    pub size_in_bytes: u64,
}

/// A durable, segmented FIFO of binary entries with independent read
/// cursors.
///
/// One instance owns a directory of segment files exclusively (a lock
/// file keeps other processes out). Appends go to a single active
/// segment; reads happen through named [`ReadCursor`]s that each track
/// their own position.
pub struct PersistentBinaryDeque {
    shared: Arc<DequeShared>,
}

impl PersistentBinaryDeque {
    /// Starts building a deque named `nonce` in `dir`.
    #[must_use]
    pub fn builder(nonce: impl Into<String>, dir: impl Into<PathBuf>) -> DequeBuilder {
        DequeBuilder {
            nonce: nonce.into(),
            dir: dir.into(),
            config: DequeConfig::default(),
            extra_header: None,
            retention: None,
        }
    }

    /// Appends an entry without sequence ids.
    ///
    /// Returns the number of bytes the entry occupies on disk.
    pub fn offer(&self, payload: &[u8]) -> PbdResult<usize> {
        self.shared.offer(payload, IdRange::UNTRACKED)
    }

    /// Appends an entry covering the sequence-id range `ids`.
    ///
    /// Ranges must ascend strictly across offers and a deque never mixes
    /// tracked and untracked entries.
    ///
    /// # Errors
    ///
    /// [`PbdError::InvalidIds`] on a discipline violation,
    /// [`PbdError::EntryTooLarge`] when the payload cannot fit an empty
    /// segment.
    pub fn offer_with_ids(&self, payload: &[u8], ids: IdRange) -> PbdResult<usize> {
        self.shared.offer(payload, ids)
    }

    /// Writes a batch of untracked entries in front of everything
    /// already stored, so readers see them before all existing data.
    ///
    /// Only allowed while no read cursors are open.
    ///
    /// # Errors
    ///
    /// [`PbdError::InvalidOperation`] when a cursor is open, a payload is
    /// empty, or no segment index space remains in front of the deque;
    /// [`PbdError::EntryTooLarge`] when a payload cannot fit an empty
    /// segment.
    pub fn push(&self, payloads: &[Bytes]) -> PbdResult<()> {
        let entries: Vec<(Bytes, IdRange)> = payloads
            .iter()
            .map(|p| (p.clone(), IdRange::UNTRACKED))
            .collect();
        self.shared.push(&entries)
    }

    /// Writes a batch of id-tracked entries in front of everything
    /// already stored.
    ///
    /// Ranges must ascend strictly within the batch and the batch's last
    /// id must precede the oldest id currently stored.
    pub fn push_with_ids(&self, entries: &[(Bytes, IdRange)]) -> PbdResult<()> {
        self.shared.push(entries)
    }

    /// Replaces the extra-header blob stamped into segments from here on.
    /// The active segment is rolled (or, if still empty, recreated) so
    /// the new blob takes effect immediately.
    pub fn update_extra_header(&self, blob: impl Into<Bytes>) -> PbdResult<()> {
        self.shared.update_extra_header(blob.into())
    }

    /// Opens (or re-attaches to) the named cursor, positioned at the
    /// oldest retained entry it has not yet consumed.
    pub fn open_for_read(&self, name: &str) -> PbdResult<ReadCursor> {
        self.shared.open_cursor(name)
    }

    /// Closes the named cursor. Equivalent to [`ReadCursor::close`].
    pub fn close_cursor(&self, name: &str) -> PbdResult<()> {
        self.shared.close_cursor(name)
    }

    /// Runs `truncator` over every entry from the oldest forward, cutting
    /// the log at the first [`TruncatorResponse::Truncate`] or
    /// [`TruncatorResponse::Partial`] verdict, or at the first corrupt
    /// entry.
    ///
    /// Must run on a freshly opened deque, before any offers and with no
    /// read cursors open.
    pub fn parse_and_truncate(
        &self,
        mut truncator: impl FnMut(&[u8]) -> TruncatorResponse,
    ) -> PbdResult<TruncateReport> {
        self.shared.parse_and_truncate(&mut truncator)
    }

    /// Quarantines the segment at `index`: its file is renamed and kept
    /// on disk, and readers see it as empty from now on.
    pub fn quarantine_segment(&self, index: SegmentIndex) -> PbdResult<()> {
        self.shared.quarantine_segment(index)
    }

    /// Indexes of all segments currently tracked, oldest first.
    pub fn segment_indexes(&self) -> Vec<SegmentIndex> {
        self.shared.state.lock().segments.keys().copied().collect()
    }

    /// Point-in-time totals across all segments.
    pub fn stats(&self) -> PbdResult<DequeStats> {
        self.shared.stats()
    }

    /// Flushes the active segment to durable storage.
    pub fn sync(&self) -> PbdResult<()> {
        self.shared.sync()
    }

    /// Seals the active segment and marks the deque closed. Safe to call
    /// more than once; also runs on drop.
    pub fn close(&self) -> PbdResult<()> {
        self.shared.close()
    }

    /// True once the deque has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Closes the deque and deletes every segment file plus the directory
    /// lock file.
    pub fn close_and_delete(self) -> PbdResult<()> {
        let mut state = self.shared.state.lock();
        let st = &mut *state;
        st.closed = true;
        st.cursors.clear();
        for (_, seg) in std::mem::take(&mut st.segments) {
            seg.close_and_delete()?;
        }
        drop(state);
        remove_if_present(&self.shared.lock_path)?;
        Ok(())
    }
}

impl Drop for PersistentBinaryDeque {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for PersistentBinaryDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBinaryDeque")
            .field("nonce", &self.shared.nonce)
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> DequeConfig {
        DequeConfig::new().chunk_size(256)
    }

    fn open(dir: &Path) -> PersistentBinaryDeque {
        PersistentBinaryDeque::builder("t", dir)
            .config(small_config())
            .open()
            .unwrap()
    }

    #[test]
    fn offer_and_poll_in_order() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer(b"one").unwrap();
        deque.offer(b"two").unwrap();
        deque.offer(b"three").unwrap();

        let cursor = deque.open_for_read("reader").unwrap();
        for expected in [&b"one"[..], b"two", b"three"] {
            let entry = cursor.poll().unwrap().unwrap();
            assert_eq!(&entry[..], expected);
            entry.release().unwrap();
        }
        assert!(cursor.poll().unwrap().is_none());
        assert!(cursor.is_empty().unwrap());
    }

    #[test]
    fn rollover_when_segment_fills() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        // 256-byte chunks with a 52-byte header: two 80-byte payloads
        // (94-byte frames) fit, a third does not.
        let payload = [1u8; 80];
        for _ in 0..3 {
            deque.offer(&payload).unwrap();
        }
        let stats = deque.stats().unwrap();
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.entries, 3);

        let cursor = deque.open_for_read("r").unwrap();
        for _ in 0..3 {
            let entry = cursor.poll().unwrap().unwrap();
            assert_eq!(entry.len(), 80);
            entry.release().unwrap();
        }
        assert!(cursor.poll().unwrap().is_none());
    }

    #[test]
    fn ascending_id_discipline() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer_with_ids(b"a", IdRange::new(1, 10)).unwrap();

        // Overlapping range.
        assert!(matches!(
            deque.offer_with_ids(b"b", IdRange::new(5, 20)),
            Err(PbdError::InvalidIds { .. })
        ));
        // Descending range.
        assert!(matches!(
            deque.offer_with_ids(b"b", IdRange::new(20, 11)),
            Err(PbdError::InvalidIds { .. })
        ));
        // Negative start.
        assert!(matches!(
            deque.offer_with_ids(b"b", IdRange::new(-3, 30)),
            Err(PbdError::InvalidIds { .. })
        ));
        // Untracked entry in a tracked log.
        assert!(matches!(
            deque.offer(b"b"),
            Err(PbdError::InvalidIds { .. })
        ));
        // Valid continuation still works.
        deque.offer_with_ids(b"c", IdRange::new(11, 12)).unwrap();
    }

    #[test]
    fn tracked_entry_rejected_in_untracked_log() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer(b"plain").unwrap();
        assert!(matches!(
            deque.offer_with_ids(b"x", IdRange::new(0, 1)),
            Err(PbdError::InvalidIds { .. })
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        assert!(matches!(
            deque.offer(b""),
            Err(PbdError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn oversized_payload_rejected_without_roll() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer(b"fits").unwrap();
        let huge = vec![0u8; 4096];
        assert!(matches!(
            deque.offer(&huge),
            Err(PbdError::EntryTooLarge { .. })
        ));
        // The reject must not have rolled the segment.
        assert_eq!(deque.stats().unwrap().segments, 1);
    }

    #[test]
    fn directory_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        assert!(matches!(
            PersistentBinaryDeque::builder("t", dir.path())
                .config(small_config())
                .open(),
            Err(PbdError::DirectoryLocked)
        ));
        drop(deque);
    }

    #[test]
    fn different_nonces_share_a_directory() {
        let dir = tempdir().unwrap();
        let a = open(dir.path());
        let b = PersistentBinaryDeque::builder("u", dir.path())
            .config(small_config())
            .open()
            .unwrap();
        a.offer(b"for a").unwrap();
        b.offer(b"for b").unwrap();

        let cursor = b.open_for_read("r").unwrap();
        let entry = cursor.poll().unwrap().unwrap();
        assert_eq!(&entry[..], b"for b");
        entry.release().unwrap();
        assert!(cursor.poll().unwrap().is_none());
    }

    #[test]
    fn closed_deque_rejects_operations() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        let cursor = deque.open_for_read("r").unwrap();
        deque.close().unwrap();
        assert!(deque.is_closed());
        assert!(matches!(deque.offer(b"x"), Err(PbdError::Closed)));
        assert!(matches!(cursor.poll(), Err(PbdError::Closed)));
        assert!(!cursor.is_open());
    }

    #[test]
    fn close_and_delete_removes_everything() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer(b"payload").unwrap();
        deque.close_and_delete().unwrap();
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn update_extra_header_rolls_nonempty_segment() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.offer(b"before").unwrap();
        deque.update_extra_header(&b"schema-v2"[..]).unwrap();
        assert_eq!(deque.stats().unwrap().segments, 2);
        deque.offer(b"after").unwrap();

        let cursor = deque.open_for_read("r").unwrap();
        assert_eq!(&cursor.poll().unwrap().unwrap()[..], b"before");
        assert_eq!(&cursor.poll().unwrap().unwrap()[..], b"after");
    }

    #[test]
    fn update_extra_header_replaces_empty_active_in_place() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        deque.update_extra_header(&b"schema-v2"[..]).unwrap();
        assert_eq!(deque.stats().unwrap().segments, 1);
    }

    #[test]
    fn update_extra_header_repositions_parked_cursors() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        // Cursor parked at the empty active segment's entry region.
        let cursor = deque.open_for_read("r").unwrap();
        deque.update_extra_header(&b"schema-v2"[..]).unwrap();
        deque.offer(b"hello").unwrap();

        let entry = cursor.poll().unwrap().unwrap();
        assert_eq!(&entry[..], b"hello");
        entry.release().unwrap();
        assert!(cursor.poll().unwrap().is_none());
    }

    #[test]
    fn oversized_compressed_offer_does_not_roll() {
        let dir = tempdir().unwrap();
        let deque = PersistentBinaryDeque::builder("t", dir.path())
            .config(small_config().compression(true))
            .open()
            .unwrap();
        deque.offer(b"fits").unwrap();
        // An arithmetic byte progression has no repeated 4-byte runs, so
        // lz4 cannot shrink it and the raw frame exceeds an empty
        // segment's capacity.
        let noisy: Vec<u8> = (0u32..250)
            .map(|i| (i.wrapping_mul(137).wrapping_add(31) % 251) as u8)
            .collect();
        assert!(matches!(
            deque.offer(&noisy),
            Err(PbdError::EntryTooLarge { .. })
        ));
        assert_eq!(deque.stats().unwrap().segments, 1);
    }

    #[test]
    fn retention_cursor_name_is_reserved() {
        let dir = tempdir().unwrap();
        let deque = open(dir.path());
        assert!(deque.open_for_read(RETENTION_CURSOR).is_err());
    }
}
