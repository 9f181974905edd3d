//! Core type definitions for the persistent binary deque.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel meaning "no id tracked".
///
/// A segment with zero entries, or a deque whose callers never supply
/// sequence ids, carries this value in both `start_id` and `end_id`.
pub const INVALID_ID: i64 = i64::MIN;

/// Sentinel meaning "no timestamp recorded yet".
pub const INVALID_TIMESTAMP: i64 = i64::MIN;

/// Monotonically increasing index of a segment file within one deque.
///
/// Indexes are persistent (encoded in the file name) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentIndex(pub u64);

impl SegmentIndex {
    /// Creates a new segment index.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next segment index.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// The inclusive `[start, end]` sequence-id range carried by one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    /// First sequence id covered.
    pub start: i64,
    /// Last sequence id covered.
    pub end: i64,
}

impl IdRange {
    /// An untracked range (both ids invalid).
    pub const UNTRACKED: Self = Self {
        start: INVALID_ID,
        end: INVALID_ID,
    };

    /// Creates a tracked range.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Returns true when neither id is tracked.
    #[must_use]
    pub const fn is_untracked(&self) -> bool {
        self.start == INVALID_ID && self.end == INVALID_ID
    }
}

/// Current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_index_ordering() {
        let a = SegmentIndex::new(1);
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.as_u64(), 2);
    }

    #[test]
    fn untracked_range() {
        assert!(IdRange::UNTRACKED.is_untracked());
        assert!(!IdRange::new(0, 5).is_untracked());
    }

    #[test]
    fn now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
