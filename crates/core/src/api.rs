//! Request bodies and query strings of the control server.

use serde::{Deserialize, Deserializer, Serialize};

/// Per-page result posted by a client to `/submit_task_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Browser name the client was launched as.
    pub browser: String,
    /// Task id from the manifest.
    pub id: String,
    /// 0-based round index.
    pub round: usize,
    /// 1-based page number.
    pub page: u32,
    /// Rendered page as a `data:image/png;base64,...` URI.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Clients send `false`, `null` or a message.
    #[serde(default, deserialize_with = "deserialize_failure")]
    pub failure: Option<String>,
    /// Page count declared by the client for this round.
    pub last_page_num: u32,
    /// Timing stats, kept only when a stats file is configured.
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
}

/// Free-form message a client wants printed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoRequest {
    /// Sending browser.
    pub browser: String,
    /// Text to print.
    pub message: String,
}

/// Query string of `/tellMeToQuit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuitQuery {
    /// Browser asking to quit.
    #[serde(default)]
    pub browser: Option<String>,
    /// Application path the client asks to have closed.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFailure {
    Flag(bool),
    Message(String),
}

fn deserialize_failure<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawFailure>::deserialize(deserializer)? {
        None | Some(RawFailure::Flag(false)) => None,
        Some(RawFailure::Flag(true)) => Some("failed".to_string()),
        Some(RawFailure::Message(m)) if m.is_empty() => None,
        Some(RawFailure::Message(m)) => Some(m),
    })
}
