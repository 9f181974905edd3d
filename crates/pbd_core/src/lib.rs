//! # PBD Core
//!
//! A durable, segmented binary log (persistent binary deque).
//!
//! This crate provides:
//! - Crash-safe append of binary entries into fixed-capacity segment files
//! - Independent named read cursors with per-entry release accounting
//! - Optional per-entry compression and sequence-id tracking with
//!   id-based seeking
//! - Corruption recovery (truncate-at-first-bad-entry) and quarantine
//! - Time-based retention on a shared scheduler

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod cursor;
pub mod deque;
pub mod error;
pub mod naming;
pub mod retention;
pub mod segment;
pub mod types;

pub use config::{DequeConfig, RetentionConfig, DEFAULT_CHUNK_SIZE};
pub use cursor::{PolledEntry, ReadCursor, SeekErrorRule};
pub use deque::{
    DequeBuilder, DequeStats, PersistentBinaryDeque, TruncateCause, TruncateReport,
    TruncatorResponse,
};
pub use error::{PbdError, PbdResult};
pub use retention::{RetentionScheduler, RETENTION_CURSOR};
pub use segment::{OfferOutcome, Segment, SegmentHeader};
pub use types::{IdRange, SegmentIndex, INVALID_ID, INVALID_TIMESTAMP};
