//! Manifest entries and the per-page records built from client results.

use serde::{Deserialize, Serialize};

/// Kind of check applied to a task once all of its pages are in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Compare each rendered page against a stored reference image.
    Eq,
    /// Text-layer rendering, graded exactly like `Eq`.
    Text,
    /// Forward-back-forward: two independent renderings must be identical.
    Fbf,
    /// Passes if every page rendered without a reported failure.
    Load,
}

impl TestKind {
    /// Name used in manifests and in result lines.
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::Eq => "eq",
            TestKind::Text => "text",
            TestKind::Fbf => "fbf",
            TestKind::Load => "load",
        }
    }

    /// True for kinds that compare against the reference tree.
    pub fn uses_references(self) -> bool {
        matches!(self, TestKind::Eq | TestKind::Text)
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task of the test manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Unique task id.
    pub id: String,
    /// Check to apply.
    #[serde(rename = "type")]
    pub kind: TestKind,
    /// Input document path.
    pub file: String,
    /// Number of independent render passes.
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// Expected md5 of the input document (hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// If true, `<file>.link` holds the URL the document is fetched from.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub link: bool,
}

fn default_rounds() -> usize {
    1
}

/// Result of rendering a single page in a single round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    /// 1-based page number.
    pub page: u32,
    /// Encoded snapshot as submitted (a data URI).
    pub snapshot: Option<String>,
    /// Client-side failure message, if the page failed to render.
    pub failure: Option<String>,
}

/// Browser definition from a browser manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowserSpec {
    /// Display name; derived from the path when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Executable path.
    pub path: String,
}

/// Per-page timing record kept when stats collection is enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageStat {
    /// Browser that rendered the page.
    pub browser: String,
    /// Task id.
    pub pdf: String,
    /// 1-based page number.
    pub page: u32,
    /// 0-based round index.
    pub round: usize,
    /// Stats object exactly as the client sent it.
    pub stats: serde_json::Value,
}
