//! Loading and validation of the task manifest and the browser manifest.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::{BrowserSpec, ManifestEntry, TestKind};

/// Errors that make a manifest unusable. All of them abort the run.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("read {path}: {source}")]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid manifest JSON.
    #[error("parse {path}: {source}")]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// Two entries share an id.
    #[error("duplicate task id {0:?}")]
    DuplicateId(String),
    /// An entry has an empty id or file.
    #[error("task {0:?} has an empty id or file")]
    Incomplete(String),
    /// An entry asks for zero rounds.
    #[error("task {id:?} requests {rounds} rounds")]
    InvalidRounds {
        /// Task id.
        id: String,
        /// Requested round count.
        rounds: usize,
    },
    /// A forward-back-forward entry without exactly two rounds.
    #[error("forward-back-forward task {id:?} needs exactly 2 rounds, got {rounds}")]
    FbfRounds {
        /// Task id.
        id: String,
        /// Requested round count.
        rounds: usize,
    },
    /// The test filter names ids missing from the manifest.
    #[error("unrecognized test ids: {}", .0.join(" "))]
    UnknownTestIds(Vec<String>),
    /// A browser manifest with an empty list.
    #[error("browser manifest {0} lists no browsers")]
    NoBrowsers(PathBuf),
}

/// Reads and validates a task manifest (a JSON array of entries).
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let bytes = std::fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    validate_manifest(&entries)?;
    Ok(entries)
}

/// Checks the invariants the grader relies on.
pub fn validate_manifest(entries: &[ManifestEntry]) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.id.is_empty() || entry.file.is_empty() {
            return Err(ManifestError::Incomplete(entry.id.clone()));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(ManifestError::DuplicateId(entry.id.clone()));
        }
        if entry.rounds == 0 {
            return Err(ManifestError::InvalidRounds {
                id: entry.id.clone(),
                rounds: entry.rounds,
            });
        }
        if entry.kind == TestKind::Fbf && entry.rounds != 2 {
            return Err(ManifestError::FbfRounds {
                id: entry.id.clone(),
                rounds: entry.rounds,
            });
        }
    }
    Ok(())
}

/// Keeps only the entries named in `ids`. An empty filter keeps everything.
///
/// Every requested id must exist.
pub fn filter_manifest(
    entries: Vec<ManifestEntry>,
    ids: &[String],
) -> Result<Vec<ManifestEntry>, ManifestError> {
    if ids.is_empty() {
        return Ok(entries);
    }
    let known: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    let unknown: Vec<String> = ids
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(ManifestError::UnknownTestIds(unknown));
    }
    Ok(entries
        .into_iter()
        .filter(|e| ids.iter().any(|id| id == &e.id))
        .collect())
}

/// Resolves an entry's document path against the manifest directory.
pub fn resolve_file(base_dir: &Path, entry: &ManifestEntry) -> PathBuf {
    let file = Path::new(&entry.file);
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    }
}

/// Reads a browser manifest: `[{"name": "...", "path": "..."}]`.
pub fn load_browser_manifest(path: &Path) -> Result<Vec<BrowserSpec>, ManifestError> {
    let bytes = std::fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let browsers: Vec<BrowserSpec> =
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if browsers.is_empty() {
        return Err(ManifestError::NoBrowsers(path.to_path_buf()));
    }
    Ok(browsers)
}
