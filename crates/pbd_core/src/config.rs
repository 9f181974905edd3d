//! Deque and retention configuration.

use crate::error::{PbdError, PbdResult};
use crate::segment::{ENTRY_HEADER_BYTES, SEGMENT_HEADER_BYTES};
use std::time::Duration;

/// Default segment capacity: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for opening a deque.
#[derive(Debug, Clone)]
pub struct DequeConfig {
    /// Fixed capacity of one segment file, header included.
    pub chunk_size: usize,

    /// Whether to compress entries at or above the compression threshold.
    pub compression: bool,

    /// Whether to fsync the active segment after every offer.
    pub sync_on_offer: bool,
}

impl Default for DequeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: false,
            sync_on_offer: false,
        }
    }
}

impl DequeConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment capacity in bytes.
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Enables or disables per-entry compression.
    #[must_use]
    pub const fn compression(mut self, value: bool) -> Self {
        self.compression = value;
        self
    }

    /// Sets whether every offer is followed by an fsync.
    #[must_use]
    pub const fn sync_on_offer(mut self, value: bool) -> Self {
        self.sync_on_offer = value;
        self
    }

    /// Validates the configuration.
    ///
    /// A segment must be able to hold its header, the extra header, and at
    /// least one entry.
    ///
    /// # Errors
    ///
    /// Returns [`PbdError::InvalidConfig`] when the chunk size is too small.
    pub fn validate(&self, extra_header_len: usize) -> PbdResult<()> {
        let minimum = SEGMENT_HEADER_BYTES + extra_header_len + ENTRY_HEADER_BYTES + 1;
        if self.chunk_size < minimum {
            return Err(PbdError::invalid_config(format!(
                "chunk size {} cannot hold a header plus one entry (minimum {})",
                self.chunk_size, minimum
            )));
        }
        Ok(())
    }
}

/// Configuration for time-based retention.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Segments whose newest record is older than this are deleted.
    pub window: Duration,

    /// Floor for the recheck delay when a segment is not yet aged out.
    pub min_recheck_delay: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
            min_recheck_delay: Duration::from_millis(500),
        }
    }
}

impl RetentionConfig {
    /// Creates a retention configuration with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    /// Sets the minimum recheck delay.
    #[must_use]
    pub const fn min_recheck_delay(mut self, delay: Duration) -> Self {
        self.min_recheck_delay = delay;
        self
    }
}
