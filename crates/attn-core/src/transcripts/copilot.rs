//! Copilot transcript reading.
//!
//! Copilot keeps `events.jsonl` under `~/.copilot/session-state/<id>/`.
//! There is no session-id handshake, so discovery matches the workspace
//! cwd from the `session.start` event and prefers the candidate whose
//! start timestamp is closest to the attn session's launch time.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::ExtractedMessage;

pub fn find_transcript(
    home: &Path,
    cwd: &str,
    launched_at: DateTime<Utc>,
) -> Option<PathBuf> {
    let root = home.join(".copilot").join("session-state");
    let entries = std::fs::read_dir(&root).ok()?;

    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries.flatten() {
        let events = entry.path().join("events.jsonl");
        if !events.is_file() {
            continue;
        }
        let Some(start) = read_session_start(&events) else {
            continue;
        };
        if start.cwd.as_deref() != Some(cwd) {
            continue;
        }
        let distance = (start.timestamp - launched_at).num_milliseconds().abs();
        if best.as_ref().is_none_or(|(d, _)| distance < *d) {
            best = Some((distance, events));
        }
    }
    best.map(|(_, path)| path)
}

struct SessionStart {
    cwd: Option<String>,
    timestamp: DateTime<Utc>,
}

fn read_session_start(path: &Path) -> Option<SessionStart> {
    use std::io::BufRead;
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    // session.start is normally the first event, but tolerate preamble.
    for line in reader.lines().take(10) {
        let line = line.ok()?;
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if entry.get("type").and_then(|t| t.as_str()) == Some("session.start") {
            return Some(SessionStart {
                cwd: entry
                    .pointer("/data/cwd")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                timestamp: entry
                    .get("timestamp")
                    .and_then(super::parse_timestamp)?,
            });
        }
    }
    None
}

/// Events look like:
/// `{"type":"assistant.message","timestamp":"...","data":{"content":"..."}}`
pub fn last_assistant_message(path: &Path) -> std::io::Result<Option<ExtractedMessage>> {
    let contents = std::fs::read_to_string(path)?;

    let mut last_user_idx: Option<usize> = None;
    let mut last_assistant: Option<(usize, ExtractedMessage)> = None;

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        match entry.get("type").and_then(|t| t.as_str()) {
            Some("user.message") => last_user_idx = Some(idx),
            Some("assistant.message") => {
                let text = entry
                    .pointer("/data/content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                let timestamp = entry
                    .get("timestamp")
                    .and_then(super::parse_timestamp)
                    .unwrap_or_else(Utc::now);
                last_assistant = Some((
                    idx,
                    ExtractedMessage {
                        text,
                        timestamp,
                        turn_uuid: None,
                    },
                ));
            }
            _ => {}
        }
    }

    match (last_assistant, last_user_idx) {
        (Some((aidx, msg)), Some(uidx)) if aidx > uidx => Ok(Some(msg)),
        (Some((_, msg)), None) => Ok(Some(msg)),
        _ => Ok(None),
    }
}
