#![forbid(unsafe_code)]

//! Reference-test runner: serves the test pages, launches browsers and grades
//! the renderings they report back.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use reftest_core::manifest::{load_browser_manifest, load_manifest};
use reftest_core::model::BrowserSpec;
use reftest_harness::{config::HarnessConfig, http, supervisor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "reftest")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Root directory served to the browsers.
    #[arg(long, default_value = ".")]
    doc_root: PathBuf,

    /// Test manifest; artifacts are written next to it.
    #[arg(long, default_value = "test/test_manifest.json")]
    manifest_file: PathBuf,

    /// Browser executable to run the tests in. Repeatable.
    #[arg(long = "browser")]
    browsers: Vec<String>,

    /// JSON list of `{name, path}` browser definitions.
    #[arg(long, conflicts_with = "browsers")]
    browser_manifest_file: Option<PathBuf>,

    /// Stage new reference snapshots for failing or missing pages.
    #[arg(long)]
    master_mode: bool,

    /// Answer yes to confirmations (stale staging tree, reference update).
    #[arg(long)]
    no_prompts: bool,

    /// Skip downloading linked documents and verifying checksums.
    #[arg(long)]
    no_download: bool,

    /// Open the reftest analyzer in the first browser when eq tests fail.
    #[arg(long)]
    reftest: bool,

    /// Write per-page timing stats to this file.
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Milliseconds clients wait before collecting stats.
    #[arg(long, default_value_t = 0)]
    stats_delay: u64,

    /// Seconds a browser may stay silent before its tasks fail.
    #[arg(long, default_value_t = 120)]
    browser_timeout_secs: u64,

    /// Supervisor tick in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    poll_interval_ms: u64,

    /// Only run these task ids. Repeatable.
    #[arg(long = "test-filter")]
    test_filter: Vec<String>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<HarnessConfig> {
        let browsers = match &self.browser_manifest_file {
            Some(path) => load_browser_manifest(path)?,
            None => self
                .browsers
                .iter()
                .map(|path| BrowserSpec {
                    name: None,
                    path: path.clone(),
                })
                .collect(),
        };

        let artifacts_root = self
            .manifest_file
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut cfg = HarnessConfig::new(&artifacts_root, self.manifest_file);
        cfg.listen = self.listen;
        cfg.doc_root = self.doc_root;
        cfg.browsers = browsers;
        cfg.test_filter = self.test_filter;
        cfg.master_mode = self.master_mode;
        cfg.no_prompts = self.no_prompts;
        cfg.no_download = self.no_download;
        cfg.reftest = self.reftest;
        cfg.stats_file = self.stats_file;
        cfg.stats_delay_ms = self.stats_delay;
        cfg.browser_timeout = Duration::from_secs(self.browser_timeout_secs);
        cfg.poll_interval = Duration::from_millis(self.poll_interval_ms);
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = args.into_config()?;

    if cfg.browsers.is_empty() {
        return serve_only(cfg).await;
    }

    let outcome = supervisor::run_harness(cfg).await?;
    tracing::info!(counters = ?outcome.counters, "run finished");
    Ok(())
}

/// Serves the test pages without launching browsers, for manual runs.
async fn serve_only(cfg: HarnessConfig) -> anyhow::Result<()> {
    let entries = load_manifest(&cfg.manifest_file)?;
    let svc = supervisor::build_service(&cfg, entries, &[]);
    let app = http::router(Arc::clone(&svc), cfg.doc_root.clone());

    let listener = tokio::net::TcpListener::bind(cfg.listen).await?;
    println!(
        "Server running at http://{}/ ; press Ctrl+C to stop",
        listener.local_addr()?
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}
