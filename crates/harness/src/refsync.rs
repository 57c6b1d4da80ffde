//! Promotion of staged master-mode snapshots into the reference tree.

use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::state::Counters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Every eq page matched an existing reference.
    NothingToSync,
    /// Errors or consistency failures make the staged images untrustworthy.
    Blocked,
    /// The staging tree can replace the references.
    Ready,
}

pub fn decide(counters: &Counters) -> SyncDecision {
    if counters.eq_failures + counters.eq_no_snapshot == 0 {
        SyncDecision::NothingToSync
    } else if counters.fatal_failures() > 0 {
        SyncDecision::Blocked
    } else {
        SyncDecision::Ready
    }
}

/// Copies every file under `src` to the same relative path under `dst`,
/// overwriting existing files. Returns the number of files copied.
pub fn sync_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked path outside of source tree")?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create dir {}", target.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} -> {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
