//! Fetching linked test documents and verifying their checksums.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use reftest_core::manifest::resolve_file;
use reftest_core::model::ManifestEntry;

use crate::compare::error_marker;

/// Downloads every linked document that is not present yet.
///
/// A failed download leaves an empty document plus a `<file>.error` marker so
/// the affected tasks are reported as skipped rather than failed. Returns the
/// files that could not be fetched.
pub async fn download_linked(entries: &[ManifestEntry], base_dir: &Path) -> Vec<PathBuf> {
    let client = reqwest::Client::new();
    let mut failed = Vec::new();

    for entry in entries.iter().filter(|e| e.link) {
        let file = resolve_file(base_dir, entry);
        if file.exists() {
            continue;
        }
        tracing::info!(file = %file.display(), "downloading linked document");
        if let Err(e) = download_one(&client, &file).await {
            println!("ERROR: Unable to download file \"{}\".", file.display());
            tracing::warn!(file = %file.display(), error = ?e, "download failed");
            if let Err(marker_err) = write_error_marker(&file, &e) {
                tracing::error!(file = %file.display(), error = %marker_err, "failed to write error marker");
            }
            failed.push(file);
        }
    }
    failed
}

async fn download_one(client: &reqwest::Client, file: &Path) -> Result<()> {
    let link_path = link_file(file);
    let url = tokio::fs::read_to_string(&link_path)
        .await
        .with_context(|| format!("read {}", link_path.display()))?;
    let bytes = client
        .get(url.trim())
        .send()
        .await
        .context("request")?
        .error_for_status()
        .context("status")?
        .bytes()
        .await
        .context("body")?;
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(file, &bytes)
        .await
        .with_context(|| format!("write {}", file.display()))?;
    Ok(())
}

fn write_error_marker(file: &Path, err: &anyhow::Error) -> Result<()> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(file, b"")?;
    std::fs::write(error_marker(file), format!("{err:?}"))?;
    Ok(())
}

fn link_file(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".link");
    PathBuf::from(name)
}

/// A document that could not be verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureProblem {
    NotDownloaded(PathBuf),
    Unreadable(PathBuf),
    MissingChecksum { file: PathBuf, actual: String },
    ChecksumMismatch {
        file: PathBuf,
        expected: String,
        actual: String,
    },
}

impl std::fmt::Display for FixtureProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixtureProblem::NotDownloaded(file) => write!(
                f,
                "File was not downloaded. See \"{}\" file.",
                error_marker(file).display()
            ),
            FixtureProblem::Unreadable(file) => {
                write!(f, "Unable to open file for reading \"{}\".", file.display())
            }
            FixtureProblem::MissingChecksum { file, actual } => write!(
                f,
                "Missing md5 for file \"{}\". Hash for current file is \"{actual}\"",
                file.display()
            ),
            FixtureProblem::ChecksumMismatch {
                file,
                expected,
                actual,
            } => write!(
                f,
                "MD5 of file \"{}\" does not match file. Expected \"{expected}\" computed \"{actual}\"",
                file.display()
            ),
        }
    }
}

/// Checks every document against its manifest md5.
pub fn verify_checksums(entries: &[ManifestEntry], base_dir: &Path) -> Vec<FixtureProblem> {
    let mut problems = Vec::new();
    for entry in entries {
        let file = resolve_file(base_dir, entry);
        if error_marker(&file).is_file() {
            problems.push(FixtureProblem::NotDownloaded(file));
            continue;
        }
        let Ok(bytes) = std::fs::read(&file) else {
            problems.push(FixtureProblem::Unreadable(file));
            continue;
        };
        let actual = hex::encode(Md5::digest(&bytes));
        match &entry.md5 {
            None => problems.push(FixtureProblem::MissingChecksum { file, actual }),
            Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                problems.push(FixtureProblem::ChecksumMismatch {
                    file,
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {}
        }
    }
    problems
}
