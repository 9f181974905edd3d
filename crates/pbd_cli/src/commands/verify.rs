//! Verify command implementation.

use super::scan_dir;
use pbd_core::{Segment, DEFAULT_CHUNK_SIZE};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of entries checked.
    pub entries_checked: u64,
    /// Number of valid entries.
    pub valid_entries: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            entries_checked: 0,
            valid_entries: 0,
            errors: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, nonce: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying deque {:?} at {:?}", nonce, path);
    println!();

    let segments = scan_dir(path, nonce)?;
    if segments.is_empty() {
        println!("No segments found (this may be normal for a new deque)");
        return Ok(());
    }

    let mut result = VerifyResult::new();
    for found in &segments {
        if found.quarantined {
            println!("  {} ... quarantined (skipped)", found.file_name);
            continue;
        }
        match verify_segment(path, nonce, found.index, &mut result) {
            Ok(()) => println!("  {} ... ok", found.file_name),
            Err(detail) => {
                println!("  {} ... CORRUPT", found.file_name);
                result.errors.push(format!("{}: {detail}", found.file_name));
            }
        }
    }

    println!();
    println!(
        "{} of {} entries valid",
        result.valid_entries, result.entries_checked
    );
    if result.is_ok() {
        println!("✓ Deque verification passed");
        Ok(())
    } else {
        for error in &result.errors {
            println!("  {error}");
        }
        println!("✗ Deque verification failed");
        Err("Verification failed".into())
    }
}

/// Validates one segment's header and full entry stream. Returns the
/// first corruption found as an error string.
fn verify_segment(
    path: &Path,
    nonce: &str,
    index: pbd_core::SegmentIndex,
    result: &mut VerifyResult,
) -> Result<(), String> {
    let mut seg = Segment::open_for_read(path, nonce, index, DEFAULT_CHUNK_SIZE, false)
        .map_err(|e| e.to_string())?;

    let entries = seg.num_entries();
    let mut offset = seg.data_start();
    for ordinal in 0..entries {
        result.entries_checked += 1;
        match seg.read_entry(offset, ordinal) {
            Ok(Some(entry)) => {
                result.valid_entries += 1;
                offset += entry.frame_len as u64;
            }
            Ok(None) => {
                return Err(format!(
                    "entry stream ends at ordinal {ordinal}, header records {entries}"
                ));
            }
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}
