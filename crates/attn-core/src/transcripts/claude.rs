//! Claude transcript reading.
//!
//! Claude stores one JSONL file per conversation under a per-project
//! directory whose name is the working directory with every
//! non-alphanumeric character replaced by `-`.

use std::path::{Path, PathBuf};

use super::ExtractedMessage;

/// Escape a working directory into Claude's project directory name.
pub fn claude_project_dir_name(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

pub fn claude_transcript_path(home: &Path, cwd: &Path, agent_session_id: &str) -> PathBuf {
    home.join(".claude")
        .join("projects")
        .join(claude_project_dir_name(cwd))
        .join(format!("{agent_session_id}.jsonl"))
}

/// Entries look like:
/// `{"type":"assistant","uuid":"...","timestamp":"...","message":{"role":"assistant","content":[{"type":"text","text":"..."}]}}`
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
            Some("user") => {
                // Tool results echo back as user-typed entries; only a real
                // human turn resets the assistant cursor.
                if !is_tool_result(&entry) {
                    last_user_idx = Some(idx);
                }
            }
            Some("assistant") => {
                let text = extract_text(&entry);
                let timestamp = entry
                    .get("timestamp")
                    .and_then(super::parse_timestamp)
                    .unwrap_or_else(chrono::Utc::now);
                let turn_uuid = entry
                    .get("uuid")
                    .and_then(|u| u.as_str())
                    .map(str::to_string);
                last_assistant = Some((
                    idx,
                    ExtractedMessage {
                        text,
                        timestamp,
                        turn_uuid,
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

fn is_tool_result(entry: &serde_json::Value) -> bool {
    entry
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .is_some_and(|items| {
            items.iter().any(|item| {
                item.get("type").and_then(|t| t.as_str()) == Some("tool_result")
            })
        })
}

fn extract_text(entry: &serde_json::Value) -> String {
    let Some(content) = entry.pointer("/message/content") else {
        return String::new();
    };
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_dir_name_escaping() {
        assert_eq!(
            claude_project_dir_name(Path::new("/Users/me/my.proj")),
            "-Users-me-my-proj"
        );
        assert_eq!(
            claude_project_dir_name(Path::new("/tmp/under_score")),
            "-tmp-under-score"
        );
    }

    #[test]
    fn test_transcript_path_layout() {
        let path = claude_transcript_path(
            Path::new("/home/user"),
            Path::new("/tmp/proj"),
            "abc-123",
        );
        assert_eq!(
            path,
            PathBuf::from("/home/user/.claude/projects/-tmp-proj/abc-123.jsonl")
        );
    }

    fn write_transcript(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, lines.join("\n")).unwrap();
        (dir, path)
    }

    #[test]
    fn test_last_assistant_after_user() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"user","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":"do the thing"}}"#,
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"working on it"}]}}"#,
            r#"{"type":"assistant","uuid":"t-2","timestamp":"2026-03-01T10:00:09Z","message":{"role":"assistant","content":[{"type":"text","text":"done, want me to commit?"}]}}"#,
        ]);
        let msg = last_assistant_message(&path).unwrap().unwrap();
        assert_eq!(msg.text, "done, want me to commit?");
        assert_eq!(msg.turn_uuid.as_deref(), Some("t-2"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2026-03-01T10:00:09+00:00");
    }

    #[test]
    fn test_user_after_assistant_yields_none() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"hello"}]}}"#,
            r#"{"type":"user","timestamp":"2026-03-01T10:01:00Z","message":{"role":"user","content":"next task"}}"#,
        ]);
        assert!(last_assistant_message(&path).unwrap().is_none());
    }

    #[test]
    fn test_tool_result_does_not_reset_cursor() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"user","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":"run tests"}}"#,
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:03Z","message":{"role":"assistant","content":[{"type":"text","text":"running"}]}}"#,
            r#"{"type":"user","timestamp":"2026-03-01T10:00:04Z","message":{"role":"user","content":[{"type":"tool_result","content":"ok"}]}}"#,
            r#"{"type":"assistant","uuid":"t-2","timestamp":"2026-03-01T10:00:06Z","message":{"role":"assistant","content":[{"type":"text","text":"all green"}]}}"#,
        ]);
        let msg = last_assistant_message(&path).unwrap().unwrap();
        assert_eq!(msg.text, "all green");
    }

    #[test]
    fn test_multiple_text_blocks_joined() {
        let (_dir, path) = write_transcript(&[
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"part one"},{"type":"tool_use","name":"bash"},{"type":"text","text":"part two"}]}}"#,
        ]);
        let msg = last_assistant_message(&path).unwrap().unwrap();
        assert_eq!(msg.text, "part one\npart two");
    }

    #[test]
    fn test_empty_assistant_message_is_returned_empty() {
        // The classifier decides what to do with an empty message; the
        // reader must not drop it (that would retry forever).
        let (_dir, path) = write_transcript(&[
            r#"{"type":"user","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:02Z","message":{"role":"assistant","content":[]}}"#,
        ]);
        let msg = last_assistant_message(&path).unwrap().unwrap();
        assert_eq!(msg.text, "");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (_dir, path) = write_transcript(&[
            "garbage not json",
            r#"{"type":"assistant","uuid":"t-1","timestamp":"2026-03-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"ok"}]}}"#,
        ]);
        assert!(last_assistant_message(&path).unwrap().is_some());
    }
}
