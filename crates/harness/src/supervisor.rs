//! Run lifecycle: prepare, launch browsers, wait for results, report.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reftest_core::manifest::{filter_manifest, load_manifest};
use reftest_core::model::ManifestEntry;

use crate::browser::{BrowserCommand, BrowserProcess};
use crate::compare::Comparator;
use crate::config::HarnessConfig;
use crate::eqlog::EqLog;
use crate::fixtures::{download_linked, verify_checksums};
use crate::http;
use crate::refsync::{decide, sync_tree, SyncDecision};
use crate::report::{summary_lines, write_stats};
use crate::service::{blocking, HarnessService};
use crate::state::{Counters, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Launching,
    Polling,
    Reporting,
    Analyzer,
    ReferenceSync,
    Done,
}

fn enter(phase: Phase) {
    tracing::info!(?phase, "entering phase");
}

/// Final result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub counters: Counters,
    /// Files copied into the reference tree, if a sync happened.
    pub references_updated: Option<usize>,
}

/// Clears artifacts of a previous run and checks the staging tree.
pub fn prepare_dirs(config: &HarnessConfig) -> Result<()> {
    let paths = &config.paths;
    if paths.eq_log.exists() {
        std::fs::remove_file(&paths.eq_log)
            .with_context(|| format!("remove {}", paths.eq_log.display()))?;
    }
    if paths.snapshots_dir.exists() {
        std::fs::remove_dir_all(&paths.snapshots_dir)
            .with_context(|| format!("remove {}", paths.snapshots_dir.display()))?;
    }
    if paths.tmp_dir.exists() {
        if config.master_mode && config.no_prompts {
            tracing::info!(path = %paths.tmp_dir.display(), "removing stale staging tree");
            std::fs::remove_dir_all(&paths.tmp_dir)
                .with_context(|| format!("remove {}", paths.tmp_dir.display()))?;
        } else {
            bail!(
                "staging tree {} exists; remove it or rerun with --master-mode --no-prompts",
                paths.tmp_dir.display()
            );
        }
    }
    Ok(())
}

/// Manifest entries for this run, filtered and with fixtures checked.
pub async fn load_tasks(config: &HarnessConfig) -> Result<Vec<ManifestEntry>> {
    let entries = load_manifest(&config.manifest_file)?;
    let entries = filter_manifest(entries, &config.test_filter)?;

    if !config.no_download {
        let base_dir = manifest_dir(&config.manifest_file);
        let failed = download_linked(&entries, base_dir).await;
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "some linked documents could not be downloaded");
        }
        for problem in verify_checksums(&entries, base_dir) {
            println!("WARNING: {problem}");
        }
    }
    Ok(entries)
}

fn manifest_dir(manifest_file: &Path) -> &Path {
    manifest_file.parent().unwrap_or_else(|| Path::new("."))
}

fn server_base(addr: SocketAddr) -> String {
    let host = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        addr.ip().to_string()
    };
    format!("http://{host}:{}", addr.port())
}

/// URL path of `file` under the served root.
fn served_path(file: &Path, doc_root: &Path) -> String {
    match file.strip_prefix(doc_root) {
        Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
        Err(_) => file.display().to_string(),
    }
}

/// Start page URL for one browser.
pub fn browser_url(
    addr: SocketAddr,
    config: &HarnessConfig,
    browser: &str,
    browser_path: &Path,
) -> Result<String> {
    let manifest = served_path(&config.manifest_file, &config.doc_root);
    let base = format!("{}/test/test_slave.html", server_base(addr));
    let path = browser_path.display().to_string();
    let filter = serde_json::to_string(&config.test_filter)?;
    let delay = config.stats_delay_ms.to_string();
    let master = config.master_mode.to_string();
    let url = reqwest::Url::parse_with_params(
        &base,
        [
            ("browser", browser),
            ("manifestFile", manifest.as_str()),
            ("path", path.as_str()),
            ("testFilter", filter.as_str()),
            ("delay", delay.as_str()),
            ("masterMode", master.as_str()),
        ],
    )
    .context("build browser url")?;
    Ok(url.to_string())
}

/// Reftest analyzer page preloaded with this run's comparison log.
pub fn analyzer_url(addr: SocketAddr, config: &HarnessConfig) -> String {
    format!(
        "{}/test/resources/reftest-analyzer.xhtml#web={}",
        server_base(addr),
        served_path(&config.paths.eq_log, &config.doc_root)
    )
}

/// Drives the launched browsers until every task is graded or timed out.
pub struct Supervisor<B: BrowserProcess> {
    svc: Arc<HarnessService>,
    browsers: Vec<B>,
    launched: usize,
    browser_timeout: Duration,
    poll_interval: Duration,
}

impl<B: BrowserProcess> Supervisor<B> {
    pub fn new(svc: Arc<HarnessService>, browsers: Vec<B>, config: &HarnessConfig) -> Self {
        Self {
            svc,
            browsers,
            launched: 0,
            browser_timeout: config.browser_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Sets up and starts every browser. On failure the browsers started so
    /// far are torn down before the error is returned.
    pub fn launch(&mut self, url_for: impl Fn(&B) -> Result<String>) -> Result<()> {
        enter(Phase::Launching);
        for idx in 0..self.browsers.len() {
            let res = {
                let browser = &mut self.browsers[idx];
                url_for(&*browser).and_then(|url| {
                    browser.setup()?;
                    tracing::info!(browser = %browser.name(), %url, "launching browser");
                    browser.start(&url)
                })
            };
            // Counted even on failure so a half-set-up profile is removed.
            self.launched = idx + 1;
            if let Err(e) = res {
                let name = self.browsers[idx].name().to_string();
                self.teardown();
                return Err(e.context(format!("launch browser {name}")));
            }
        }
        Ok(())
    }

    /// Waits for state changes or the poll tick and sweeps timeouts on each wake.
    pub async fn poll_until_done(&self) {
        enter(Phase::Polling);
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.svc.is_done().await {
                break;
            }
            tokio::select! {
                _ = self.svc.changed() => {}
                _ = tick.tick() => {}
            }
            let stalled = self
                .svc
                .sweep_timeouts(Instant::now(), self.browser_timeout)
                .await;
            if !stalled.is_empty() {
                tracing::warn!(?stalled, "browsers timed out");
            }
        }
    }

    /// Tears down every launched browser. Failures are logged only.
    pub fn teardown(&mut self) {
        for browser in self.browsers.iter_mut().take(self.launched) {
            if let Err(e) = browser.teardown() {
                tracing::warn!(browser = %browser.name(), error = ?e, "browser teardown failed");
            }
        }
        self.launched = 0;
    }

    /// With `--reftest` and eq failures, shows `url` in the first browser and
    /// blocks until the user closes it. Returns whether the analyzer was shown.
    pub fn open_reftest_analyzer(
        &mut self,
        config: &HarnessConfig,
        counters: &Counters,
        url: &str,
    ) -> Result<bool> {
        if !config.reftest || counters.eq_failures == 0 {
            return Ok(false);
        }
        let Some(browser) = self.browsers.first_mut() else {
            return Ok(false);
        };
        enter(Phase::Analyzer);
        tracing::info!(browser = %browser.name(), %url, "opening reftest analyzer");
        browser.setup()?;
        let shown = browser.start(url).and_then(|()| blocking(|| browser.wait()));
        let cleaned = browser.teardown();
        shown.and(cleaned).context("reftest analyzer")?;
        Ok(true)
    }
}

/// Prints the summary, writes stats, and promotes staged references.
pub async fn finish(
    svc: &HarnessService,
    config: &HarnessConfig,
    started: Instant,
) -> Result<RunOutcome> {
    let counters = report(svc, config, started).await;
    conclude(config, counters)
}

/// Prints the summary and writes the stats file.
pub async fn report(svc: &HarnessService, config: &HarnessConfig, started: Instant) -> Counters {
    enter(Phase::Reporting);
    let counters = svc.counters().await;
    println!();
    for line in summary_lines(&counters) {
        println!("{line}");
    }
    println!("Runtime was {} seconds", started.elapsed().as_secs());

    if let Some(stats_file) = &config.stats_file {
        let stats = svc.take_stats().await;
        if let Err(e) = write_stats(stats_file, &stats) {
            tracing::error!(error = ?e, "failed to write stats");
        }
    }
    counters
}

/// Promotes staged references in master mode and ends the run.
pub fn conclude(config: &HarnessConfig, counters: Counters) -> Result<RunOutcome> {
    let references_updated = if config.master_mode {
        enter(Phase::ReferenceSync);
        sync_references(config, &counters)?
    } else {
        None
    };

    enter(Phase::Done);
    Ok(RunOutcome {
        counters,
        references_updated,
    })
}

fn sync_references(config: &HarnessConfig, counters: &Counters) -> Result<Option<usize>> {
    let paths = &config.paths;
    match decide(counters) {
        SyncDecision::NothingToSync => Ok(None),
        SyncDecision::Blocked => {
            println!(
                "OHNOES!  Some failures or errors occurred; refusing to update reference snapshots from {}",
                paths.tmp_dir.display()
            );
            Ok(None)
        }
        SyncDecision::Ready if !config.no_prompts => {
            println!(
                "Reference snapshots need updating; rerun with --no-prompts to copy {} into {}. Nothing was updated.",
                paths.tmp_dir.display(),
                paths.ref_dir.display()
            );
            Ok(None)
        }
        SyncDecision::Ready => {
            if !paths.tmp_dir.exists() {
                println!("No staged snapshots to sync.");
                return Ok(None);
            }
            let copied = sync_tree(&paths.tmp_dir, &paths.ref_dir)?;
            std::fs::remove_dir_all(&paths.tmp_dir)
                .with_context(|| format!("remove {}", paths.tmp_dir.display()))?;
            println!("Updated {copied} reference snapshots in {}", paths.ref_dir.display());
            Ok(Some(copied))
        }
    }
}

/// Builds the shared service for a run over `entries`.
pub fn build_service(
    config: &HarnessConfig,
    entries: Vec<ManifestEntry>,
    browser_names: &[String],
) -> Arc<HarnessService> {
    let state = RunState::new(
        entries,
        browser_names,
        EqLog::new(config.paths.eq_log.clone()),
        Instant::now(),
    );
    let comparator = Comparator::new(
        config.paths.clone(),
        config.platform.clone(),
        config.master_mode,
        manifest_dir(&config.manifest_file).to_path_buf(),
    );
    Arc::new(HarnessService::new(state, comparator, config.collect_stats()))
}

/// Runs a full session with real browser processes.
pub async fn run_harness(config: HarnessConfig) -> Result<RunOutcome> {
    let started = Instant::now();
    enter(Phase::Loading);
    prepare_dirs(&config)?;
    let entries = load_tasks(&config).await?;

    let log_dir = manifest_dir(&config.manifest_file).to_path_buf();
    let browsers = config
        .browsers
        .iter()
        .map(|spec| BrowserCommand::from_spec(spec, &config.doc_root, &log_dir))
        .collect::<Result<Vec<_>>>()?;
    let names: Vec<String> = browsers.iter().map(|b| b.name().to_string()).collect();
    let unique: std::collections::HashSet<&String> = names.iter().collect();
    if unique.len() != names.len() {
        bail!("browser names must be unique: {names:?}");
    }
    tracing::info!(tasks = entries.len(), browsers = ?names, "manifest loaded");

    let svc = build_service(&config, entries, &names);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    let addr = listener.local_addr()?;
    let app = http::router(Arc::clone(&svc), config.doc_root.clone());
    tracing::info!(listen = %addr, "server started");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server failed");
        }
    });

    let mut supervisor = Supervisor::new(Arc::clone(&svc), browsers, &config);
    let launched = supervisor.launch(|b| browser_url(addr, &config, b.name(), b.path()));
    if let Err(e) = launched {
        server.abort();
        return Err(e);
    }
    supervisor.poll_until_done().await;
    supervisor.teardown();

    let counters = report(&svc, &config, started).await;
    let analyzer = analyzer_url(addr, &config);
    if let Err(e) = supervisor.open_reftest_analyzer(&config, &counters, &analyzer) {
        tracing::error!(error = ?e, "reftest analyzer failed");
    }
    server.abort();

    conclude(&config, counters)
}
