//! Transcript discovery and tail reading.
//!
//! Each agent records its conversation in a different on-disk format;
//! the classifier only needs one thing from all of them: the last
//! assistant message strictly after the most recent user turn, with its
//! recorded timestamp and (when available) turn UUID.

mod claude;
mod codex;
mod copilot;
mod watcher;

pub use claude::{claude_project_dir_name, claude_transcript_path};
pub use watcher::{QuietWindowEvent, TranscriptWatcher};

use std::path::{Path, PathBuf};

use attn_protocol::types::AgentKind;
use chrono::{DateTime, Utc};

use crate::sessions::Session;

/// The last assistant message extracted from a transcript tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMessage {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub turn_uuid: Option<String>,
}

/// Locate the transcript file for a session.
///
/// - Claude: JSONL under `~/.claude/projects/<escaped-cwd>/<sid>.jsonl`
/// - Codex: `session_meta`-prefixed JSONL under `~/.codex/sessions`
/// - Copilot: `events.jsonl` under `~/.copilot/session-state/<id>`,
///   matched by workspace cwd, preferring the candidate whose
///   `session.start` is closest to the session's launch time
pub fn locate_transcript(home: &Path, session: &Session) -> Option<PathBuf> {
    match session.agent {
        AgentKind::Claude => {
            let sid = session.resume_session_id.as_deref()?;
            let path = claude::claude_transcript_path(home, Path::new(&session.cwd), sid);
            path.exists().then_some(path)
        }
        AgentKind::Codex => codex::find_transcript(
            home,
            session.resume_session_id.as_deref(),
            &session.cwd,
        ),
        AgentKind::Copilot => {
            copilot::find_transcript(home, &session.cwd, session.launched_at)
        }
        AgentKind::Shell => None,
    }
}

/// Read the last assistant message strictly after the most recent user
/// turn. `Ok(None)` means the transcript has not flushed that message yet
/// (callers retry briefly).
pub fn last_assistant_message(
    agent: AgentKind,
    path: &Path,
) -> std::io::Result<Option<ExtractedMessage>> {
    match agent {
        AgentKind::Claude => claude::last_assistant_message(path),
        AgentKind::Codex => codex::last_assistant_message(path),
        AgentKind::Copilot => copilot::last_assistant_message(path),
        AgentKind::Shell => Ok(None),
    }
}

/// Retry wrapper for the flush race: transcripts land on disk a beat
/// after the turn ends.
pub async fn last_assistant_message_with_retry(
    agent: AgentKind,
    path: &Path,
    attempts: u32,
    delay: std::time::Duration,
) -> std::io::Result<Option<ExtractedMessage>> {
    for attempt in 0..attempts {
        match last_assistant_message(agent, path)? {
            Some(msg) => return Ok(Some(msg)),
            None if attempt + 1 < attempts => tokio::time::sleep(delay).await,
            None => {}
        }
    }
    Ok(None)
}

/// Parse a transcript timestamp field (RFC 3339 or epoch millis).
pub(crate) fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        serde_json::Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let value = serde_json::json!("2026-03-01T10:00:00Z");
        let ts = parse_timestamp(&value).unwrap();
        assert_eq!(ts.timestamp(), 1772359200);
    }

    #[test]
    fn test_parse_timestamp_millis() {
        let value = serde_json::json!(1772359200123i64);
        let ts = parse_timestamp(&value).unwrap();
        assert_eq!(ts.timestamp_millis(), 1772359200123);
    }

    #[test]
    fn test_parse_timestamp_invalid() {
        assert!(parse_timestamp(&serde_json::json!("not a time")).is_none());
        assert!(parse_timestamp(&serde_json::json!(null)).is_none());
    }

    #[tokio::test]
    async fn test_retry_returns_none_when_never_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "").unwrap();
        let result = last_assistant_message_with_retry(
            AgentKind::Claude,
            &path,
            2,
            std::time::Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }
}
