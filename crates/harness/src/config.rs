use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use reftest_core::model::BrowserSpec;

/// Where the harness reads references from and writes its artifacts to.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    /// Canonical reference images: `<ref_dir>/<platform>/<browser>/<task>/<page>.png`.
    pub ref_dir: PathBuf,
    /// Master-mode staging tree, same layout as `ref_dir`.
    pub tmp_dir: PathBuf,
    /// Failing test/reference image pairs.
    pub snapshots_dir: PathBuf,
    /// Comparison log in reftest-analyzer format.
    pub eq_log: PathBuf,
}

impl ArtifactPaths {
    /// Default layout under a test directory.
    pub fn under(root: &Path) -> Self {
        Self {
            ref_dir: root.join("ref"),
            tmp_dir: root.join("tmp"),
            snapshots_dir: root.join("test_snapshots"),
            eq_log: root.join("eq.log"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub listen: SocketAddr,
    /// Root served to the browsers.
    pub doc_root: PathBuf,
    pub manifest_file: PathBuf,
    pub browsers: Vec<BrowserSpec>,
    /// Only run these task ids (all when empty).
    pub test_filter: Vec<String>,

    pub master_mode: bool,
    /// Answer yes to every confirmation (stale staging tree, reference update).
    pub no_prompts: bool,
    pub no_download: bool,
    /// Open the reftest analyzer in the first browser when eq comparisons fail.
    pub reftest: bool,

    pub stats_file: Option<PathBuf>,
    /// Delay the clients wait before collecting stats.
    pub stats_delay_ms: u64,

    pub browser_timeout: Duration,
    pub poll_interval: Duration,

    pub paths: ArtifactPaths,
    /// Platform component of reference paths.
    pub platform: String,
}

impl HarnessConfig {
    /// Minimal configuration rooted at `root`, used by tests and as a base for the CLI.
    pub fn new(root: &Path, manifest_file: PathBuf) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            doc_root: root.to_path_buf(),
            manifest_file,
            browsers: Vec::new(),
            test_filter: Vec::new(),
            master_mode: false,
            no_prompts: false,
            no_download: false,
            reftest: false,
            stats_file: None,
            stats_delay_ms: 0,
            browser_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            paths: ArtifactPaths::under(root),
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Rejects option combinations that cannot work together.
    pub fn validate(&mut self) -> Result<()> {
        if self.browser_timeout.is_zero() {
            bail!("browser timeout must be positive");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.stats_file.is_none() {
            self.stats_delay_ms = 0;
        }
        if self.master_mode && !self.test_filter.is_empty() {
            bail!("--master-mode and --test-filter must not be specified at the same time");
        }
        Ok(())
    }

    pub fn collect_stats(&self) -> bool {
        self.stats_file.is_some()
    }
}
