//! Grades a completed task and updates the run counters.
//!
//! Every graded task yields at least one `TEST-*` line; these lines are the
//! result protocol read by people and CI log scrapers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reftest_core::decode_data_uri;
use reftest_core::manifest::resolve_file;
use reftest_core::model::{ManifestEntry, PageResult, TestKind};

use crate::config::ArtifactPaths;
use crate::eqlog::EqLog;
use crate::state::{Counters, TaskResultSet};

/// Outcome of grading one task for one browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Comparator {
    paths: ArtifactPaths,
    platform: String,
    master_mode: bool,
    /// Directory manifest file paths are relative to.
    fixture_root: PathBuf,
}

impl Comparator {
    pub fn new(paths: ArtifactPaths, platform: String, master_mode: bool, fixture_root: PathBuf) -> Self {
        Self {
            paths,
            platform,
            master_mode,
            fixture_root,
        }
    }

    /// `<ref>/<platform>/<browser>/<task>/<page>.png`
    pub fn reference_path(&self, browser: &str, task_id: &str, page: u32) -> PathBuf {
        self.task_dir(&self.paths.ref_dir, browser, task_id)
            .join(format!("{page}.png"))
    }

    /// Same layout as [`Self::reference_path`] under the staging tree.
    pub fn staging_path(&self, browser: &str, task_id: &str, page: u32) -> PathBuf {
        self.task_dir(&self.paths.tmp_dir, browser, task_id)
            .join(format!("{page}.png"))
    }

    fn task_dir(&self, root: &Path, browser: &str, task_id: &str) -> PathBuf {
        root.join(&self.platform).join(browser).join(task_id)
    }

    /// Grades a task whose rounds are complete and sorted by page.
    pub fn grade(
        &self,
        entry: &ManifestEntry,
        browser: &str,
        results: &TaskResultSet,
        counters: &mut Counters,
        eq_log: &mut EqLog,
    ) -> Verdict {
        counters.runs += 1;
        let mut lines = Vec::new();

        if self.report_client_failures(entry, browser, results, counters, &mut lines) {
            return Verdict {
                passed: false,
                lines,
            };
        }

        let passed = match entry.kind {
            TestKind::Eq | TestKind::Text => {
                self.check_eq(entry, browser, results, counters, eq_log, &mut lines)
            }
            TestKind::Fbf => check_fbf(entry, browser, results, counters, &mut lines),
            TestKind::Load => check_load(entry, browser, &mut lines),
        };
        Verdict { passed, lines }
    }

    /// Reports every page that failed to render. Returns true if any did.
    ///
    /// Failures of documents that could not be downloaded are skips, not errors.
    fn report_client_failures(
        &self,
        entry: &ManifestEntry,
        browser: &str,
        results: &TaskResultSet,
        counters: &mut Counters,
        lines: &mut Vec<String>,
    ) -> bool {
        let not_downloaded = error_marker(&resolve_file(&self.fixture_root, entry)).exists();
        let mut failed = false;
        for (round, round_results) in results.rounds.iter().enumerate() {
            for result in &round_results.pages {
                let Some(failure) = &result.failure else {
                    continue;
                };
                failed = true;
                if not_downloaded {
                    lines.push(format!(
                        "TEST-SKIPPED | PDF was not downloaded {} | in {} | page{} round {} | {}",
                        entry.id,
                        browser,
                        result.page,
                        round,
                        failure
                    ));
                } else {
                    counters.errors += 1;
                    lines.push(format!(
                        "TEST-UNEXPECTED-FAIL | test failed {} | in {} | page{} round {} | {}",
                        entry.id,
                        browser,
                        result.page,
                        round,
                        failure
                    ));
                }
            }
        }
        failed
    }

    fn check_eq(
        &self,
        entry: &ManifestEntry,
        browser: &str,
        results: &TaskResultSet,
        counters: &mut Counters,
        eq_log: &mut EqLog,
        lines: &mut Vec<String>,
    ) -> bool {
        let kind = entry.kind;
        let mut passed = true;
        let pages = results.rounds.first().map(|r| r.pages.as_slice()).unwrap_or_default();

        for result in pages {
            let page = result.page;
            let snapshot = match decode_snapshot(result) {
                Ok(bytes) => bytes,
                Err(e) => {
                    counters.errors += 1;
                    passed = false;
                    lines.push(format!(
                        "TEST-UNEXPECTED-FAIL | {kind} {} | in {browser} | page {page} has no valid snapshot: {e:#}",
                        entry.id
                    ));
                    continue;
                }
            };

            let ref_path = self.reference_path(browser, &entry.id, page);
            let matches = match std::fs::read(&ref_path) {
                Err(_) => {
                    counters.eq_no_snapshot += 1;
                    if !self.master_mode {
                        lines.push(format!("WARNING: no reference snapshot {}", ref_path.display()));
                    }
                    false
                }
                Ok(reference) if reference == snapshot => true,
                Ok(reference) => {
                    counters.eq_failures += 1;
                    passed = false;
                    lines.push(format!(
                        "TEST-UNEXPECTED-FAIL | {kind} {} | in {browser} | rendering of page {page} != reference rendering",
                        entry.id
                    ));
                    if let Err(e) =
                        self.save_failure(browser, &entry.id, page, &snapshot, &reference, eq_log)
                    {
                        tracing::error!(task = %entry.id, browser, page, error = %e, "failed to save mismatching snapshot");
                    }
                    false
                }
            };

            if self.master_mode && !matches {
                let staged = self.staging_path(browser, &entry.id, page);
                if let Err(e) = write_image(&staged, &snapshot) {
                    tracing::error!(path = %staged.display(), error = %e, "failed to stage snapshot");
                }
            }
        }

        if passed {
            lines.push(format!("TEST-PASS | {kind} test {} | in {browser}", entry.id));
        }
        passed
    }

    fn save_failure(
        &self,
        browser: &str,
        task_id: &str,
        page: u32,
        snapshot: &[u8],
        reference: &[u8],
        eq_log: &mut EqLog,
    ) -> Result<()> {
        let dir = self.task_dir(&self.paths.snapshots_dir, browser, task_id);
        let test_image = dir.join(format!("{page}.png"));
        let ref_image = dir.join(format!("{page}_ref.png"));
        write_image(&test_image, snapshot)?;
        write_image(&ref_image, reference)?;
        eq_log.record(browser, task_id, page, &test_image, &ref_image)
    }
}

fn check_fbf(
    entry: &ManifestEntry,
    browser: &str,
    results: &TaskResultSet,
    counters: &mut Counters,
    lines: &mut Vec<String>,
) -> bool {
    let [first, second] = results.rounds.as_slice() else {
        counters.fbf_failures += 1;
        lines.push(format!(
            "TEST-UNEXPECTED-FAIL | forward-back-forward test {} | in {browser} | expected 2 rounds, got {}",
            entry.id,
            results.rounds.len()
        ));
        return false;
    };

    let mut passed = true;
    if first.pages.len() != second.pages.len() {
        counters.fbf_failures += 1;
        passed = false;
        lines.push(format!(
            "TEST-UNEXPECTED-FAIL | forward-back-forward test {} | in {browser} | round 1 has {} pages, round 2 has {}",
            entry.id,
            first.pages.len(),
            second.pages.len()
        ));
    }

    for (r0, r1) in first.pages.iter().zip(&second.pages) {
        if r0.snapshot != r1.snapshot {
            counters.fbf_failures += 1;
            passed = false;
            lines.push(format!(
                "TEST-UNEXPECTED-FAIL | forward-back-forward test {} | in {browser} | first rendering of page {} != second",
                entry.id, r0.page
            ));
        }
    }

    if passed {
        lines.push(format!(
            "TEST-PASS | forward-back-forward test {} | in {browser}",
            entry.id
        ));
    }
    passed
}

/// Client failures were already reported, so reaching this point is a pass.
fn check_load(entry: &ManifestEntry, browser: &str, lines: &mut Vec<String>) -> bool {
    lines.push(format!("TEST-PASS | load test {} | in {browser}", entry.id));
    true
}

fn decode_snapshot(result: &PageResult) -> Result<Vec<u8>> {
    let data = result.snapshot.as_deref().context("snapshot missing")?;
    Ok(decode_data_uri(data)?)
}

/// Marker written next to a document whose download failed.
pub fn error_marker(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".error");
    PathBuf::from(name)
}

fn write_image(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}
