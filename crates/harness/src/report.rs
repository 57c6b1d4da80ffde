//! End-of-run summary and the timing-stats file.

use std::path::Path;

use anyhow::{Context, Result};
use reftest_core::model::PageStat;

use crate::state::Counters;

/// Summary lines printed once every browser is done.
pub fn summary_lines(counters: &Counters) -> Vec<String> {
    if counters.all_passed() {
        let line = if counters.runs == 0 {
            "OHNOES!  No tests ran!"
        } else {
            "All regression tests passed."
        };
        return vec![line.to_string()];
    }

    let mut lines = vec!["OHNOES!  Some tests failed!".to_string()];
    if counters.errors > 0 {
        lines.push(format!("  errors: {}", counters.errors));
    }
    if counters.eq_failures > 0 {
        lines.push(format!("  different ref/snapshot: {}", counters.eq_failures));
    }
    if counters.fbf_failures > 0 {
        lines.push(format!(
            "  different first/second rendering: {}",
            counters.fbf_failures
        ));
    }
    lines
}

pub fn write_stats(path: &Path, stats: &[PageStat]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(stats)?;
    std::fs::write(path, json).with_context(|| format!("write stats {}", path.display()))?;
    tracing::info!(path = %path.display(), records = stats.len(), "wrote stats");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn no_runs() {
        assert_eq!(summary_lines(&Counters::default()), vec!["OHNOES!  No tests ran!"]);
    }

    #[test]
    fn timeouts_without_graded_tasks_still_fail() {
        let c = Counters {
            errors: 5,
            ..Counters::default()
        };
        assert_eq!(
            summary_lines(&c),
            vec!["OHNOES!  Some tests failed!", "  errors: 5"]
        );
    }

    #[test]
    fn failures_list_only_nonzero_counters() {
        let c = Counters {
            runs: 4,
            errors: 2,
            fbf_failures: 1,
            ..Counters::default()
        };
        assert_eq!(
            summary_lines(&c),
            vec![
                "OHNOES!  Some tests failed!",
                "  errors: 2",
                "  different first/second rendering: 1"
            ]
        );
    }

    #[test]
    fn stats_are_pretty_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/stats.json");
        let stats = vec![PageStat {
            browser: "firefox".into(),
            pdf: "doc1".into(),
            page: 1,
            round: 0,
            stats: serde_json::json!({"render": 12}),
        }];

        write_stats(&path, &stats).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'));
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back[0]["pdf"], "doc1");
    }
}
