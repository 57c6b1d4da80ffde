//! Run supervision with in-process browsers.

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use common::{config, entry, page, service, PNG_A, PNG_B};
use reftest_core::model::TestKind;
use reftest_harness::browser::BrowserProcess;
use reftest_harness::report::summary_lines;
use reftest_harness::service::HarnessService;
use reftest_harness::supervisor::{finish, report, Supervisor};
use tempfile::tempdir;

/// Submits results straight to the service instead of rendering anything.
struct FakeBrowser {
    name: String,
    path: PathBuf,
    svc: Arc<HarnessService>,
    /// (task id, snapshot) pairs submitted on start.
    tasks: Vec<(String, &'static str)>,
    fail_start: bool,
    teardowns: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
    waits: Arc<AtomicUsize>,
}

impl FakeBrowser {
    fn new(name: &str, svc: &Arc<HarnessService>, teardowns: &Arc<AtomicUsize>) -> Self {
        Self {
            name: name.into(),
            path: PathBuf::from(format!("/opt/{name}")),
            svc: Arc::clone(svc),
            tasks: Vec::new(),
            fail_start: false,
            teardowns: Arc::clone(teardowns),
            urls: Arc::default(),
            waits: Arc::default(),
        }
    }
}

impl BrowserProcess for FakeBrowser {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, url: &str) -> Result<()> {
        if self.fail_start {
            bail!("no display");
        }
        self.urls.lock().unwrap().push(url.to_string());
        let svc = Arc::clone(&self.svc);
        let name = self.name.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            for (task, snapshot) in tasks {
                tokio::time::sleep(Duration::from_millis(10)).await;
                svc.submit(page(&name, &task, 0, 1, 1, snapshot)).await.unwrap();
            }
        });
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn run_finishes_when_every_browser_reports() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.poll_interval = Duration::from_millis(20);
    let entries = vec![entry("doc1", TestKind::Load, 1), entry("doc2", TestKind::Load, 1)];
    let svc = service(&cfg, entries, &["firefox", "chrome"]);
    let teardowns = Arc::new(AtomicUsize::new(0));

    let browsers = ["firefox", "chrome"]
        .into_iter()
        .map(|name| {
            let mut b = FakeBrowser::new(name, &svc, &teardowns);
            b.tasks = vec![("doc1".into(), PNG_A), ("doc2".into(), PNG_B)];
            b
        })
        .collect();
    let mut supervisor = Supervisor::new(Arc::clone(&svc), browsers, &cfg);

    supervisor.launch(|b| Ok(format!("http://test/{}", b.name()))).unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor.poll_until_done())
        .await
        .unwrap();
    supervisor.teardown();

    let outcome = finish(&svc, &cfg, Instant::now()).await.unwrap();
    assert_eq!(outcome.counters.runs, 4);
    assert!(outcome.counters.all_passed());
    assert_eq!(outcome.references_updated, None);
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn silent_browser_times_out() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.poll_interval = Duration::from_millis(20);
    cfg.browser_timeout = Duration::from_millis(100);
    let entries = (1..=3)
        .map(|i| entry(&format!("doc{i}"), TestKind::Load, 1))
        .collect();
    let svc = service(&cfg, entries, &["firefox"]);
    let teardowns = Arc::new(AtomicUsize::new(0));

    let browsers = vec![FakeBrowser::new("firefox", &svc, &teardowns)];
    let mut supervisor = Supervisor::new(Arc::clone(&svc), browsers, &cfg);
    supervisor.launch(|_| Ok("http://test/".into())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor.poll_until_done())
        .await
        .unwrap();
    supervisor.teardown();

    let c = svc.counters().await;
    assert_eq!(c.errors, 3);
    assert_eq!(c.runs, 0);
    assert_eq!(svc.pending_sets().await, 0);
    assert_eq!(
        summary_lines(&c),
        vec!["OHNOES!  Some tests failed!", "  errors: 3"]
    );
}

#[tokio::test]
async fn launch_failure_tears_down_started_browsers() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let svc = service(&cfg, vec![entry("doc1", TestKind::Load, 1)], &["a", "b", "c"]);
    let teardowns = Arc::new(AtomicUsize::new(0));

    let mut failing = FakeBrowser::new("b", &svc, &teardowns);
    failing.fail_start = true;
    let browsers = vec![
        FakeBrowser::new("a", &svc, &teardowns),
        failing,
        FakeBrowser::new("c", &svc, &teardowns),
    ];
    let mut supervisor = Supervisor::new(Arc::clone(&svc), browsers, &cfg);

    let err = supervisor.launch(|_| Ok("http://test/".into())).unwrap_err();

    assert!(format!("{err:#}").contains("no display"));
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn master_run_promotes_staged_references() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.master_mode = true;
    cfg.no_prompts = true;
    cfg.poll_interval = Duration::from_millis(20);
    let svc = service(&cfg, vec![entry("doc1", TestKind::Eq, 1)], &["firefox"]);
    let teardowns = Arc::new(AtomicUsize::new(0));

    let mut browser = FakeBrowser::new("firefox", &svc, &teardowns);
    browser.tasks = vec![("doc1".into(), PNG_A)];
    let mut supervisor = Supervisor::new(Arc::clone(&svc), vec![browser], &cfg);
    supervisor.launch(|_| Ok("http://test/".into())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor.poll_until_done())
        .await
        .unwrap();
    supervisor.teardown();

    let outcome = finish(&svc, &cfg, Instant::now()).await.unwrap();

    assert_eq!(outcome.counters.eq_no_snapshot, 1);
    assert_eq!(outcome.references_updated, Some(1));
    let promoted = cfg.paths.ref_dir.join("linux/firefox/doc1/1.png");
    assert_eq!(std::fs::read(promoted).unwrap(), b"ABC");
    assert!(!cfg.paths.tmp_dir.exists());
}

#[tokio::test]
async fn master_run_without_confirmation_keeps_references() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.master_mode = true;
    let svc = service(&cfg, vec![entry("doc1", TestKind::Eq, 1)], &["firefox"]);
    svc.submit(page("firefox", "doc1", 0, 1, 1, PNG_A)).await.unwrap();

    let outcome = finish(&svc, &cfg, Instant::now()).await.unwrap();

    assert_eq!(outcome.references_updated, None);
    assert!(cfg.paths.tmp_dir.join("linux/firefox/doc1/1.png").exists());
    assert!(!cfg.paths.ref_dir.exists());
}

#[tokio::test]
async fn reftest_opens_analyzer_after_eq_failures() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.reftest = true;
    cfg.poll_interval = Duration::from_millis(20);
    let ref_dir = cfg.paths.ref_dir.join("linux/firefox/doc1");
    std::fs::create_dir_all(&ref_dir).unwrap();
    std::fs::write(ref_dir.join("1.png"), b"ABC").unwrap();
    let svc = service(&cfg, vec![entry("doc1", TestKind::Eq, 1)], &["firefox", "chrome"]);
    let teardowns = Arc::new(AtomicUsize::new(0));

    let mut first = FakeBrowser::new("firefox", &svc, &teardowns);
    first.tasks = vec![("doc1".into(), PNG_B)];
    let urls = Arc::clone(&first.urls);
    let waits = Arc::clone(&first.waits);
    let mut second = FakeBrowser::new("chrome", &svc, &teardowns);
    second.tasks = vec![("doc1".into(), PNG_A)];
    let second_waits = Arc::clone(&second.waits);
    let mut supervisor = Supervisor::new(Arc::clone(&svc), vec![first, second], &cfg);
    supervisor.launch(|_| Ok("http://test/run".into())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), supervisor.poll_until_done())
        .await
        .unwrap();
    supervisor.teardown();

    let counters = report(&svc, &cfg, Instant::now()).await;
    let analyzer = "http://test/test/resources/reftest-analyzer.xhtml#web=/eq.log";
    let shown = supervisor
        .open_reftest_analyzer(&cfg, &counters, analyzer)
        .unwrap();

    assert!(shown);
    assert_eq!(counters.eq_failures, 1);
    assert_eq!(*urls.lock().unwrap(), vec!["http://test/run", analyzer]);
    assert_eq!(waits.load(Ordering::SeqCst), 1);
    assert_eq!(second_waits.load(Ordering::SeqCst), 0);
    assert_eq!(teardowns.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn analyzer_stays_closed_without_eq_failures() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.reftest = true;
    let svc = service(&cfg, vec![entry("doc1", TestKind::Load, 1)], &["firefox"]);
    svc.submit(page("firefox", "doc1", 0, 1, 1, PNG_A)).await.unwrap();
    let teardowns = Arc::new(AtomicUsize::new(0));
    let browser = FakeBrowser::new("firefox", &svc, &teardowns);
    let urls = Arc::clone(&browser.urls);
    let mut supervisor = Supervisor::new(Arc::clone(&svc), vec![browser], &cfg);

    let counters = report(&svc, &cfg, Instant::now()).await;
    let shown = supervisor
        .open_reftest_analyzer(&cfg, &counters, "http://test/analyzer")
        .unwrap();

    assert!(!shown);
    assert!(urls.lock().unwrap().is_empty());
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
}
