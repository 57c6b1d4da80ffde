//! In-memory run state shared by the control server and the supervisor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use reftest_core::model::{ManifestEntry, PageResult, PageStat};
use thiserror::Error;

use crate::eqlog::EqLog;

/// Aggregate outcome counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Tasks graded (timeouts excluded).
    pub runs: usize,
    /// Hard errors: client render failures and unresponsive browsers.
    pub errors: usize,
    pub eq_failures: usize,
    /// Pages without a reference image.
    pub eq_no_snapshot: usize,
    pub fbf_failures: usize,
}

impl Counters {
    /// Failures that block a reference update.
    pub fn fatal_failures(&self) -> usize {
        self.errors + self.fbf_failures
    }

    pub fn all_passed(&self) -> bool {
        self.fatal_failures() == 0 && self.eq_failures == 0
    }
}

/// Results received so far for one round of a task.
#[derive(Debug, Clone, Default)]
pub struct RoundResults {
    pub pages: Vec<PageResult>,
    /// Page count declared by the client for this round.
    pub last_page_num: Option<u32>,
}

/// Why a page result could not be recorded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("round {round} out of range (task has {rounds})")]
    RoundOutOfRange { round: usize, rounds: usize },
    #[error("page {page} already submitted for round {round}")]
    DuplicatePage { round: usize, page: u32 },
    #[error("round {round} declared {previous} pages before, now {declared}")]
    PageCountChanged {
        round: usize,
        previous: u32,
        declared: u32,
    },
}

/// All pending results of one task for one browser.
#[derive(Debug, Clone)]
pub struct TaskResultSet {
    pub rounds: Vec<RoundResults>,
}

impl TaskResultSet {
    pub fn new(rounds: usize) -> Self {
        Self {
            rounds: vec![RoundResults::default(); rounds],
        }
    }

    /// Appends a page result. Results are kept in arrival order.
    pub fn record(
        &mut self,
        round: usize,
        result: PageResult,
        last_page_num: u32,
    ) -> Result<(), RecordError> {
        let rounds = self.rounds.len();
        let slot = self
            .rounds
            .get_mut(round)
            .ok_or(RecordError::RoundOutOfRange { round, rounds })?;
        match slot.last_page_num {
            Some(previous) if previous != last_page_num => {
                return Err(RecordError::PageCountChanged {
                    round,
                    previous,
                    declared: last_page_num,
                });
            }
            _ => slot.last_page_num = Some(last_page_num),
        }
        if slot.pages.iter().any(|p| p.page == result.page) {
            return Err(RecordError::DuplicatePage {
                round,
                page: result.page,
            });
        }
        slot.pages.push(result);
        Ok(())
    }

    /// Orders every round by page number.
    pub fn sort_pages(&mut self) {
        for round in &mut self.rounds {
            round.pages.sort_by_key(|p| p.page);
        }
    }
}

/// Everything mutable about a run. Guarded by a single lock in [`crate::service`].
#[derive(Debug)]
pub struct RunState {
    pub manifest: BTreeMap<String, ManifestEntry>,
    /// browser -> task id -> pending results.
    pub results: HashMap<String, HashMap<String, TaskResultSet>>,
    pub remaining: BTreeMap<String, usize>,
    pub last_contact: HashMap<String, Instant>,
    /// (browser, task) pairs that were graded or force-failed.
    pub closed: HashSet<(String, String)>,
    pub counters: Counters,
    pub eq_log: EqLog,
    pub stats: Vec<PageStat>,
    pub done: bool,
}

impl RunState {
    /// Seeds an empty result set for every browser and task.
    pub fn new(
        manifest: Vec<ManifestEntry>,
        browsers: &[String],
        eq_log: EqLog,
        now: Instant,
    ) -> Self {
        let manifest: BTreeMap<String, ManifestEntry> =
            manifest.into_iter().map(|e| (e.id.clone(), e)).collect();

        let mut results = HashMap::new();
        let mut remaining = BTreeMap::new();
        let mut last_contact = HashMap::new();
        for browser in browsers {
            let tasks = manifest
                .values()
                .map(|e| (e.id.clone(), TaskResultSet::new(e.rounds)))
                .collect();
            results.insert(browser.clone(), tasks);
            remaining.insert(browser.clone(), manifest.len());
            last_contact.insert(browser.clone(), now);
        }

        let mut state = Self {
            manifest,
            results,
            remaining,
            last_contact,
            closed: HashSet::new(),
            counters: Counters::default(),
            eq_log,
            stats: Vec::new(),
            done: false,
        };
        state.check_if_done();
        state
    }

    pub fn is_known_browser(&self, browser: &str) -> bool {
        self.remaining.contains_key(browser)
    }

    pub fn is_closed(&self, browser: &str, task: &str) -> bool {
        self.closed
            .contains(&(browser.to_string(), task.to_string()))
    }

    /// Marks a task finished for a browser and updates the remaining count.
    pub fn finish_task(&mut self, browser: &str, task: &str) {
        self.closed.insert((browser.to_string(), task.to_string()));
        if let Some(r) = self.remaining.get_mut(browser) {
            *r = r.saturating_sub(1);
        }
        self.check_if_done();
    }

    /// Recomputes the global `done` flag.
    pub fn check_if_done(&mut self) -> bool {
        self.done = self.remaining.values().all(|r| *r == 0);
        self.done
    }

    /// Number of task result sets still waiting for pages.
    pub fn pending_sets(&self) -> usize {
        self.results.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reftest_core::model::TestKind;

    fn page(n: u32) -> PageResult {
        PageResult {
            page: n,
            snapshot: Some(format!("data:image/png;base64,{n}")),
            failure: None,
        }
    }

    fn entry(id: &str, rounds: usize) -> ManifestEntry {
        ManifestEntry {
            id: id.into(),
            kind: TestKind::Load,
            file: format!("{id}.pdf"),
            rounds,
            md5: None,
            link: false,
        }
    }

    #[test]
    fn record_rejects_duplicate_pages() {
        let mut set = TaskResultSet::new(1);
        set.record(0, page(1), 2).unwrap();
        assert_eq!(
            set.record(0, page(1), 2),
            Err(RecordError::DuplicatePage { round: 0, page: 1 })
        );
    }

    #[test]
    fn record_rejects_changed_page_count() {
        let mut set = TaskResultSet::new(1);
        set.record(0, page(1), 2).unwrap();
        assert!(matches!(
            set.record(0, page(2), 3),
            Err(RecordError::PageCountChanged { previous: 2, declared: 3, .. })
        ));
    }

    #[test]
    fn record_rejects_unknown_round() {
        let mut set = TaskResultSet::new(2);
        assert_eq!(
            set.record(2, page(1), 1),
            Err(RecordError::RoundOutOfRange { round: 2, rounds: 2 })
        );
    }

    #[test]
    fn sort_orders_by_page() {
        let mut set = TaskResultSet::new(1);
        for n in [3, 1, 2] {
            set.record(0, page(n), 3).unwrap();
        }
        set.sort_pages();
        let pages: Vec<u32> = set.rounds[0].pages.iter().map(|p| p.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[test]
    fn new_state_seeds_every_browser() {
        let state = RunState::new(
            vec![entry("a", 1), entry("b", 2)],
            &["firefox".into(), "chrome".into()],
            EqLog::disabled(),
            Instant::now(),
        );
        assert_eq!(state.pending_sets(), 4);
        assert_eq!(state.remaining["firefox"], 2);
        assert_eq!(state.results["chrome"]["b"].rounds.len(), 2);
        assert!(!state.done);
    }

    #[test]
    fn empty_manifest_is_done_immediately() {
        let state = RunState::new(vec![], &["firefox".into()], EqLog::disabled(), Instant::now());
        assert!(state.done);
    }

    #[test]
    fn finishing_last_task_sets_done() {
        let mut state = RunState::new(
            vec![entry("a", 1)],
            &["firefox".into()],
            EqLog::disabled(),
            Instant::now(),
        );
        state.finish_task("firefox", "a");
        assert!(state.is_closed("firefox", "a"));
        assert!(state.done);
    }
}
