//! Inspect command implementation.

use super::scan_dir;
use pbd_core::{Segment, DEFAULT_CHUNK_SIZE, INVALID_ID, INVALID_TIMESTAMP};
use std::path::Path;

/// Runs the inspect command.
pub fn run(path: &Path, nonce: &str) -> Result<(), Box<dyn std::error::Error>> {
    let segments = scan_dir(path, nonce)?;
    if segments.is_empty() {
        println!("No segments for nonce {:?} in {:?}", nonce, path);
        return Ok(());
    }

    println!("Deque {:?} at {:?}", nonce, path);
    println!();
    println!(
        "{:>8}  {:>8}  {:>10}  {:>22}  {:>15}  {}",
        "segment", "entries", "bytes", "id range", "last written", "state"
    );

    let mut total_entries = 0u64;
    let mut total_bytes = 0u64;
    for found in &segments {
        if found.quarantined {
            println!(
                "{:>8}  {:>8}  {:>10}  {:>22}  {:>15}  quarantined",
                found.index.as_u64(),
                "-",
                "-",
                "-",
                "-"
            );
            continue;
        }
        let seg = Segment::open_for_read(path, nonce, found.index, DEFAULT_CHUNK_SIZE, false)?;
        let id_range = if seg.start_id() == INVALID_ID {
            "untracked".to_string()
        } else {
            format!("[{}, {}]", seg.start_id(), seg.end_id())
        };
        let last_written = if seg.last_timestamp() == INVALID_TIMESTAMP {
            "never".to_string()
        } else {
            format!("{} ms", seg.last_timestamp())
        };
        let state = if seg.is_finalized() { "finalized" } else { "open" };
        println!(
            "{:>8}  {:>8}  {:>10}  {:>22}  {:>15}  {}",
            found.index.as_u64(),
            seg.num_entries(),
            seg.size_in_bytes(),
            id_range,
            last_written,
            state
        );
        total_entries += u64::from(seg.num_entries());
        total_bytes += seg.size_in_bytes();
    }

    println!();
    println!(
        "{} segments, {} entries, {} payload bytes",
        segments.len(),
        total_entries,
        total_bytes
    );
    Ok(())
}
