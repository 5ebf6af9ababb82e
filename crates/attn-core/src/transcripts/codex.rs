//! Codex transcript reading.
//!
//! Codex writes JSONL rollout files under `~/.codex/sessions/` (nested in
//! date directories). The first line is a `session_meta` record carrying
//! the session id and workspace cwd; response items follow.

use std::path::{Path, PathBuf};

use super::ExtractedMessage;

/// Find the rollout file for a session, matching by meta session id when
/// known, else by workspace cwd. Newest file wins.
pub fn find_transcript(
    home: &Path,
    agent_session_id: Option<&str>,
    cwd: &str,
) -> Option<PathBuf> {
    let root = home.join(".codex").join("sessions");
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    collect_jsonl(&root, &mut candidates);
    // Newest first: the matching session is almost always recent.
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in candidates {
        let Some(meta) = read_session_meta(&path) else {
            continue;
        };
        let matches = match agent_session_id {
            Some(sid) => meta.id.as_deref() == Some(sid),
            None => meta.cwd.as_deref() == Some(cwd),
        };
        if matches {
            return Some(path);
        }
    }
    None
}

struct SessionMeta {
    id: Option<String>,
    cwd: Option<String>,
}

fn read_session_meta(path: &Path) -> Option<SessionMeta> {
    use std::io::BufRead;
    let file = std::fs::File::open(path).ok()?;
    let mut first_line = String::new();
    std::io::BufReader::new(file).read_line(&mut first_line).ok()?;
    let entry: serde_json::Value = serde_json::from_str(first_line.trim()).ok()?;
    if entry.get("type").and_then(|t| t.as_str()) != Some("session_meta") {
        return None;
    }
    Some(SessionMeta {
        id: entry
            .pointer("/payload/id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        cwd: entry
            .pointer("/payload/cwd")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn collect_jsonl(dir: &Path, out: &mut Vec<(std::time::SystemTime, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl(&path, out);
        } else if path.extension().is_some_and(|e| e == "jsonl") {
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            out.push((mtime, path));
        }
    }
}

/// Response items look like:
/// `{"timestamp":"...","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"..."}]}}`
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
        if entry.get("type").and_then(|t| t.as_str()) != Some("response_item") {
            continue;
        }
        if entry.pointer("/payload/type").and_then(|t| t.as_str()) != Some("message") {
            continue;
        }
        match entry.pointer("/payload/role").and_then(|r| r.as_str()) {
            Some("user") => last_user_idx = Some(idx),
            Some("assistant") => {
                let text = entry
                    .pointer("/payload/content")
                    .and_then(|c| c.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter(|item| {
                                matches!(
                                    item.get("type").and_then(|t| t.as_str()),
                                    Some("output_text") | Some("text")
                                )
                            })
                            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                let timestamp = entry
                    .get("timestamp")
                    .and_then(super::parse_timestamp)
                    .unwrap_or_else(chrono::Utc::now);
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
