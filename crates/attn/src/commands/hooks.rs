//! Hook relay subcommands.
//!
//! Agents invoke these at lifecycle transitions with a JSON payload on
//! stdin; the relay forwards a control-socket message and always exits
//! 0 — a broken daemon must never break the agent the hook runs inside.

use std::io::Read;

use attn_paths::AttnPaths;
use attn_protocol::client::send_to_daemon;
use attn_protocol::hook::HookMessage;
use attn_protocol::types::TodoItem;
use chrono::{DateTime, Utc};
use clap::ArgMatches;
use tracing::debug;

fn read_stdin_json() -> Option<serde_json::Value> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    serde_json::from_str(raw.trim()).ok()
}

fn relay(message: &HookMessage) {
    let socket = AttnPaths::resolve()
        .ok()
        .and_then(|paths| attn_core::load_daemon_config(&paths).ok().map(|c| (paths, c)))
        .map(|(paths, config)| config.socket_path(&paths));
    let Some(socket) = socket else {
        debug!(event = "cli.hook.paths_unavailable");
        return;
    };
    if let Err(e) = send_to_daemon(&socket, message) {
        // Swallowed: hooks exit 0 even when the daemon is down.
        debug!(event = "cli.hook.relay_failed", error = %e);
    }
}

fn payload_timestamp(payload: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    payload?
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(|t| t.parse::<DateTime<Utc>>().ok())
}

/// `attn _hook-stop <session-id>`: end-of-turn notification. The stdin
/// payload carries the agent-native session id (the resume handle), the
/// transcript path, and the turn UUID when the agent assigns one.
pub(crate) fn handle_hook_stop(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session-id")
        .cloned()
        .unwrap_or_default();
    let payload = read_stdin_json();

    let get = |key: &str| {
        payload
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    relay(&HookMessage::Stop {
        session_id,
        turn_uuid: get("last_message_uuid").or_else(|| get("uuid")),
        agent_session_id: get("session_id"),
        transcript_path: get("transcript_path"),
        timestamp: payload_timestamp(payload.as_ref()),
    });
    Ok(())
}

/// `attn _hook-state <session-id> <state>`: direct state report.
pub(crate) fn handle_hook_state(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session-id")
        .cloned()
        .unwrap_or_default();
    let state = matches
        .get_one::<String>("state")
        .cloned()
        .unwrap_or_default();
    let payload = read_stdin_json();

    relay(&HookMessage::State {
        session_id,
        state,
        timestamp: payload_timestamp(payload.as_ref()),
    });
    Ok(())
}

/// `attn _hook-todo <session-id>`: todo list update. The stdin payload
/// carries the agent's todo array.
pub(crate) fn handle_hook_todo(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session-id")
        .cloned()
        .unwrap_or_default();
    let payload = read_stdin_json();

    let todos = payload
        .as_ref()
        .and_then(|p| p.get("todos"))
        .and_then(|t| t.as_array())
        .map(|items| items.iter().filter_map(parse_todo).collect())
        .unwrap_or_default();

    relay(&HookMessage::Todos { session_id, todos });
    Ok(())
}

fn parse_todo(item: &serde_json::Value) -> Option<TodoItem> {
    let text = item
        .get("content")
        .or_else(|| item.get("text"))
        .and_then(|t| t.as_str())?;
    let completed = item
        .get("status")
        .and_then(|s| s.as_str())
        .map(|s| s == "completed")
        .or_else(|| item.get("completed").and_then(|c| c.as_bool()))
        .unwrap_or(false);
    Some(TodoItem {
        text: text.to_string(),
        completed,
    })
}
