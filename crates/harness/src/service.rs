use std::time::{Duration, Instant};

use reftest_core::api::{InfoRequest, QuitQuery, SubmitRequest};
use reftest_core::model::{PageResult, PageStat};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Mutex, Notify};

use crate::compare::{Comparator, Verdict};
use crate::completion::task_complete;
use crate::state::{Counters, RecordError, RunState};

/// Why a result submission was refused. Every variant is a client or
/// harness contract bug, never a test outcome.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("unknown browser {0:?}")]
    UnknownBrowser(String),
    #[error("unknown task {0:?}")]
    UnknownTask(String),
    #[error("task {task:?} was already graded for {browser:?}")]
    AlreadyGraded { browser: String, task: String },
    #[error("invalid page {page} (declared page count {last_page_num})")]
    InvalidPage { page: u32, last_page_num: u32 },
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// What happened to an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Recorded; the task still waits for pages.
    Pending,
    /// The submission completed the task and it was graded.
    Graded(Verdict),
}

/// Main service implementing the control-plane logic.
pub struct HarnessService {
    state: Mutex<RunState>,
    comparator: Comparator,
    collect_stats: bool,
    changed: Notify,
}

impl HarnessService {
    pub fn new(state: RunState, comparator: Comparator, collect_stats: bool) -> Self {
        Self {
            state: Mutex::new(state),
            comparator,
            collect_stats,
            changed: Notify::new(),
        }
    }

    /// Records one page result and grades the task once it is complete.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitOutcome, SubmitError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        if !st.is_known_browser(&req.browser) {
            return Err(SubmitError::UnknownBrowser(req.browser));
        }
        st.last_contact.insert(req.browser.clone(), Instant::now());

        let entry = st
            .manifest
            .get(&req.id)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownTask(req.id.clone()))?;
        if st.is_closed(&req.browser, &req.id) {
            return Err(SubmitError::AlreadyGraded {
                browser: req.browser,
                task: req.id,
            });
        }
        if req.page == 0 || req.last_page_num == 0 || req.page > req.last_page_num {
            return Err(SubmitError::InvalidPage {
                page: req.page,
                last_page_num: req.last_page_num,
            });
        }

        let set = st
            .results
            .get_mut(&req.browser)
            .and_then(|tasks| tasks.get_mut(&req.id))
            .ok_or_else(|| SubmitError::UnknownTask(req.id.clone()))?;
        set.record(
            req.round,
            PageResult {
                page: req.page,
                snapshot: req.snapshot,
                failure: req.failure,
            },
            req.last_page_num,
        )?;

        if self.collect_stats {
            st.stats.push(PageStat {
                browser: req.browser.clone(),
                pdf: req.id.clone(),
                page: req.page,
                round: req.round,
                stats: req.stats.unwrap_or(serde_json::Value::Null),
            });
        }

        if !task_complete(set) {
            return Ok(SubmitOutcome::Pending);
        }

        let mut results = st
            .results
            .get_mut(&req.browser)
            .and_then(|tasks| tasks.remove(&req.id))
            .ok_or_else(|| SubmitError::UnknownTask(req.id.clone()))?;
        results.sort_pages();

        let verdict = blocking(|| {
            self.comparator.grade(
                &entry,
                &req.browser,
                &results,
                &mut st.counters,
                &mut st.eq_log,
            )
        });
        for line in &verdict.lines {
            println!("{line}");
        }
        tracing::debug!(task = %req.id, browser = %req.browser, passed = verdict.passed, "task graded");

        st.finish_task(&req.browser, &req.id);
        drop(guard);
        self.changed.notify_waiters();

        Ok(SubmitOutcome::Graded(verdict))
    }

    /// Prints a message sent by a client.
    pub async fn info(&self, req: InfoRequest) {
        let mut st = self.state.lock().await;
        if st.is_known_browser(&req.browser) {
            st.last_contact.insert(req.browser.clone(), Instant::now());
        }
        println!("{}", req.message);
    }

    /// Best-effort request to close a client application.
    ///
    /// Only needed on macOS, where closing the last window leaves the
    /// application running.
    pub async fn quit(&self, query: QuitQuery) {
        tracing::info!(browser = ?query.browser, path = ?query.path, "client asked to quit");
        if !cfg!(target_os = "macos") {
            return;
        }
        let Some(app) = query.path else {
            return;
        };
        let script = format!("tell application \"{app}\" to quit");
        match tokio::process::Command::new("osascript")
            .arg("-e")
            .arg(script)
            .status()
            .await
        {
            Ok(status) if !status.success() => {
                tracing::warn!(%status, app = %app, "osascript quit failed")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, app = %app, "failed to run osascript"),
        }
    }

    /// Force-fails every outstanding task of browsers silent for longer than
    /// `timeout`. Returns the names of the browsers that timed out.
    pub async fn sweep_timeouts(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let stalled: Vec<String> = st
            .remaining
            .iter()
            .filter(|(_, remaining)| **remaining > 0)
            .filter(|(browser, _)| {
                st.last_contact
                    .get(browser.as_str())
                    .map_or(true, |last| now.saturating_duration_since(*last) > timeout)
            })
            .map(|(browser, _)| browser.clone())
            .collect();

        for browser in &stalled {
            println!("{}", timeout_line(browser, timeout));
            let remaining = st.remaining.insert(browser.clone(), 0).unwrap_or(0);
            st.counters.errors += remaining;
            if let Some(pending) = st.results.get_mut(browser) {
                for (task, _) in pending.drain() {
                    st.closed.insert((browser.clone(), task));
                }
            }
            tracing::warn!(browser = %browser, remaining, "browser timed out");
        }

        if !stalled.is_empty() {
            st.check_if_done();
            drop(guard);
            self.changed.notify_waiters();
        }
        stalled
    }

    /// Resolves after the next state change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    pub async fn is_done(&self) -> bool {
        self.state.lock().await.done
    }

    pub async fn counters(&self) -> Counters {
        self.state.lock().await.counters
    }

    pub async fn remaining(&self, browser: &str) -> Option<usize> {
        self.state.lock().await.remaining.get(browser).copied()
    }

    pub async fn pending_sets(&self) -> usize {
        self.state.lock().await.pending_sets()
    }

    pub async fn take_stats(&self) -> Vec<PageStat> {
        std::mem::take(&mut self.state.lock().await.stats)
    }

    pub async fn eq_log_entries(&self) -> usize {
        self.state.lock().await.eq_log.entries()
    }
}

/// Runs file-system heavy work without stalling other tasks on the worker.
/// Falls back to a plain call on a current-thread runtime, where
/// `block_in_place` is unavailable.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn timeout_line(browser: &str, timeout: Duration) -> String {
    format!("TEST-UNEXPECTED-FAIL | test failed {browser} has not responded in {timeout:?}")
}
