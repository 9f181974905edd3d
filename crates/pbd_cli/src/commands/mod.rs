//! CLI command implementations.

pub mod inspect;
pub mod verify;

use pbd_core::naming::{self, ParsedFileName};
use pbd_core::SegmentIndex;
use std::path::Path;
use tracing::debug;

/// A segment file found in a deque directory.
pub struct FoundSegment {
    /// Segment index from the file name.
    pub index: SegmentIndex,
    /// File name within the directory.
    pub file_name: String,
    /// Whether the file carries the quarantine marker.
    pub quarantined: bool,
}

/// Lists the deque's segment files, oldest first.
pub fn scan_dir(path: &Path, nonce: &str) -> std::io::Result<Vec<FoundSegment>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let ParsedFileName::Ok {
            nonce: file_nonce,
            index,
            quarantined,
        } = naming::parse(&file_name)
        {
            if file_nonce == nonce {
                debug!(file = %file_name, segment = %index, quarantined, "found segment file");
                found.push(FoundSegment {
                    index,
                    file_name,
                    quarantined,
                });
            }
        }
    }
    found.sort_by_key(|s| s.index);
    Ok(found)
}
