//! Error types for the persistent binary deque.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for deque operations.
pub type PbdResult<T> = Result<T, PbdError>;

/// Errors that can occur in deque operations.
///
/// Capacity exhaustion is deliberately absent: a full segment is expected
/// control flow and is reported through [`crate::segment::OfferOutcome`],
/// never through this type.
#[derive(Debug, Error)]
pub enum PbdError {
    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment file is corrupted or structurally invalid.
    #[error("corruption in {file}: {detail} (offset {offset})")]
    Corruption {
        /// File in which the corruption was detected.
        file: PathBuf,
        /// Byte offset of the first invalid data.
        offset: u64,
        /// Description of what failed validation.
        detail: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored on disk.
        expected: u32,
        /// Checksum computed over the data.
        actual: u32,
    },

    /// No segment covers the requested entry id.
    ///
    /// A distinct, named condition so callers can pick
    /// [`crate::cursor::SeekErrorRule`] semantics without matching on
    /// generic I/O errors.
    #[error("no segment covers entry id {id}")]
    SeekNotFound {
        /// The id that was looked up.
        id: i64,
    },

    /// A payload cannot fit even in an empty segment.
    #[error("entry of {size} bytes exceeds segment capacity of {capacity} bytes")]
    EntryTooLarge {
        /// Payload size including the entry header.
        size: usize,
        /// Usable capacity of an empty segment.
        capacity: usize,
    },

    /// Offered ids violate the deque's id discipline.
    #[error("invalid entry ids: {message}")]
    InvalidIds {
        /// Description of the violation.
        message: String,
    },

    /// Operation on a closed deque or cursor.
    #[error("deque is closed")]
    Closed,

    /// Another process holds the deque directory lock.
    #[error("deque directory locked: another process has exclusive access")]
    DirectoryLocked,

    /// Configuration rejected at open time.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl PbdError {
    /// Creates a corruption error.
    pub fn corruption(file: impl Into<PathBuf>, offset: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            file: file.into(),
            offset,
            detail: detail.into(),
        }
    }

    /// Creates an invalid-ids error.
    pub fn invalid_ids(message: impl Into<String>) -> Self {
        Self::InvalidIds {
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
