//! Segment file name codec.
//!
//! Segment files are named `<nonce>_<id>.pbd`, where `<nonce>` is the
//! caller-chosen name for one deque's family of files and `<id>` is the
//! segment index, zero-padded to 15 digits so lexicographic order matches
//! numeric order. Quarantined segments carry a `_q` marker before the
//! extension: `<nonce>_<id>_q.pbd`.

use crate::types::SegmentIndex;
use std::path::{Path, PathBuf};

/// File extension for segment files.
pub const PBD_EXTENSION: &str = "pbd";

/// Suffix marking a quarantined segment, inserted before the extension.
const QUARANTINE_MARKER: &str = "_q";

/// Number of digits in the zero-padded segment index.
const INDEX_DIGITS: usize = 15;

/// Shortest possible valid name: one-character nonce plus `_` plus index
/// plus `.pbd`.
const MIN_NAME_LEN: usize = 1 + 1 + INDEX_DIGITS + 1 + PBD_EXTENSION.len();

/// Result of parsing a file name found in a deque directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFileName {
    /// A well-formed segment file name.
    Ok {
        /// The deque family the file belongs to.
        nonce: String,
        /// The segment index encoded in the name.
        index: SegmentIndex,
        /// Whether the file carries the quarantine marker.
        quarantined: bool,
    },
    /// Not a segment file at all (wrong extension); ignore it.
    NotALogFile,
    /// Has the segment extension but a malformed name.
    InvalidName,
}

/// Formats the file name for a segment.
#[must_use]
pub fn file_name(nonce: &str, index: SegmentIndex, quarantined: bool) -> String {
    if quarantined {
        format!(
            "{nonce}_{:0width$}{QUARANTINE_MARKER}.{PBD_EXTENSION}",
            index.as_u64(),
            width = INDEX_DIGITS
        )
    } else {
        format!(
            "{nonce}_{:0width$}.{PBD_EXTENSION}",
            index.as_u64(),
            width = INDEX_DIGITS
        )
    }
}

/// Formats the full path of a segment file inside `dir`.
#[must_use]
pub fn file_path(dir: &Path, nonce: &str, index: SegmentIndex, quarantined: bool) -> PathBuf {
    dir.join(file_name(nonce, index, quarantined))
}

/// Formats the path of the sidecar finality marker for a segment.
///
/// The marker records that the segment was cleanly finalized, letting the
/// next open skip the corruption scan for it.
#[must_use]
pub fn finality_marker_path(dir: &Path, nonce: &str, index: SegmentIndex) -> PathBuf {
    dir.join(format!(
        "{nonce}_{:0width$}.fin",
        index.as_u64(),
        width = INDEX_DIGITS
    ))
}

/// Parses a file name from a deque directory listing.
#[must_use]
pub fn parse(name: &str) -> ParsedFileName {
    let Some(stem) = name.strip_suffix(&format!(".{PBD_EXTENSION}")) else {
        return ParsedFileName::NotALogFile;
    };
    if name.len() < MIN_NAME_LEN {
        return ParsedFileName::InvalidName;
    }

    let (stem, quarantined) = match stem.strip_suffix(QUARANTINE_MARKER) {
        Some(rest) => (rest, true),
        None => (stem, false),
    };

    let Some((nonce, digits)) = stem.rsplit_once('_') else {
        return ParsedFileName::InvalidName;
    };
    if nonce.is_empty()
        || digits.len() != INDEX_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return ParsedFileName::InvalidName;
    }
    let Ok(index) = digits.parse::<u64>() else {
        return ParsedFileName::InvalidName;
    };

    ParsedFileName::Ok {
        nonce: nonce.to_string(),
        index: SegmentIndex::new(index),
        quarantined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trip() {
        let name = file_name("export", SegmentIndex::new(42), false);
        assert_eq!(name, "export_000000000000042.pbd");
        assert_eq!(
            parse(&name),
            ParsedFileName::Ok {
                nonce: "export".to_string(),
                index: SegmentIndex::new(42),
                quarantined: false,
            }
        );
    }

    #[test]
    fn quarantine_round_trip() {
        let name = file_name("export", SegmentIndex::new(7), true);
        assert_eq!(name, "export_000000000000007_q.pbd");
        assert_eq!(
            parse(&name),
            ParsedFileName::Ok {
                nonce: "export".to_string(),
                index: SegmentIndex::new(7),
                quarantined: true,
            }
        );
    }

    #[test]
    fn nonce_may_contain_underscores() {
        let name = file_name("cmd_log", SegmentIndex::new(1), false);
        assert_eq!(
            parse(&name),
            ParsedFileName::Ok {
                nonce: "cmd_log".to_string(),
                index: SegmentIndex::new(1),
                quarantined: false,
            }
        );
    }

    #[test]
    fn foreign_files_are_not_log_files() {
        assert_eq!(parse("MANIFEST"), ParsedFileName::NotALogFile);
        assert_eq!(parse("export_000000000000001.fin"), ParsedFileName::NotALogFile);
        assert_eq!(parse("notes.txt"), ParsedFileName::NotALogFile);
    }

    #[test]
    fn malformed_names_are_invalid() {
        // Too short overall.
        assert_eq!(parse("x.pbd"), ParsedFileName::InvalidName);
        // Wrong digit count.
        assert_eq!(parse("export_0042.pbd"), ParsedFileName::InvalidName);
        // Non-digit index.
        assert_eq!(
            parse("export_00000000000004x.pbd"),
            ParsedFileName::InvalidName
        );
        // Missing nonce.
        assert_eq!(parse("_000000000000001.pbd"), ParsedFileName::InvalidName);
    }
}
