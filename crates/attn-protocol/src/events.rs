use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AttachInfo, PrInfo, RecentLocation, SessionSnapshot, SessionState, TodoItem, UserSettings,
};

/// Daemon -> Client events over the WebSocket.
///
/// Each variant maps to a JSON message with `"event"` as the tag field.
/// `*_result` events echo the correlation keys of the command they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DaemonEvent {
    /// First event on every connection, deferred until the recovery
    /// barrier lifts.
    #[serde(rename = "initial_state")]
    InitialState {
        protocol_version: String,
        daemon_instance_id: String,
        sessions: Vec<SessionSnapshot>,
        prs: Vec<PrInfo>,
        repo_mutes: Vec<String>,
        author_mutes: Vec<String>,
        settings: UserSettings,
        recent_locations: Vec<RecentLocation>,
        /// Degraded-mode banners and similar persistent warnings.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },

    #[serde(rename = "spawn_result")]
    SpawnResult {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "attach_result")]
    AttachResult {
        session_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<AttachInfo>,
    },

    /// Streaming PTY output for an attached session.
    #[serde(rename = "pty_output")]
    PtyOutput {
        session_id: String,
        /// Base64-encoded raw PTY bytes.
        data: String,
        seq: u64,
    },

    /// The subscriber stream lost data and must re-attach.
    #[serde(rename = "pty_desync")]
    PtyDesync { session_id: String, reason: String },

    #[serde(rename = "session_exited")]
    SessionExited {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "session_registered")]
    SessionRegistered { session: SessionSnapshot },

    #[serde(rename = "session_state_changed")]
    SessionStateChanged {
        session_id: String,
        state: SessionState,
        state_since: DateTime<Utc>,
        state_updated_at: DateTime<Utc>,
    },

    #[serde(rename = "session_todos_updated")]
    SessionTodosUpdated {
        session_id: String,
        todos: Vec<TodoItem>,
    },

    #[serde(rename = "session_unregistered")]
    SessionUnregistered { session_id: String },

    #[serde(rename = "kill_result")]
    KillResult {
        session_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "clear_result")]
    ClearResult {
        success: bool,
        removed: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Answer for PR commands; echoes the PR `id` correlation key.
    #[serde(rename = "pr_action_result")]
    PrActionResult {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "prs_updated")]
    PrsUpdated { prs: Vec<PrInfo> },

    #[serde(rename = "settings_updated")]
    SettingsUpdated { settings: UserSettings },

    #[serde(rename = "recent_locations_updated")]
    RecentLocationsUpdated { locations: Vec<RecentLocation> },

    /// Persistent warning: the store fell back to in-memory.
    #[serde(rename = "storage_degraded")]
    StorageDegraded { db_path: String, hint: String },

    /// Unknown or malformed command, or a command refused by policy.
    #[serde(rename = "command_error")]
    CommandError {
        /// Echo of the offending `cmd` (or "unknown").
        cmd: String,
        code: String,
        message: String,
    },
}

impl DaemonEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonEvent::InitialState { .. } => "initial_state",
            DaemonEvent::SpawnResult { .. } => "spawn_result",
            DaemonEvent::AttachResult { .. } => "attach_result",
            DaemonEvent::PtyOutput { .. } => "pty_output",
            DaemonEvent::PtyDesync { .. } => "pty_desync",
            DaemonEvent::SessionExited { .. } => "session_exited",
            DaemonEvent::SessionRegistered { .. } => "session_registered",
            DaemonEvent::SessionStateChanged { .. } => "session_state_changed",
            DaemonEvent::SessionTodosUpdated { .. } => "session_todos_updated",
            DaemonEvent::SessionUnregistered { .. } => "session_unregistered",
            DaemonEvent::KillResult { .. } => "kill_result",
            DaemonEvent::ClearResult { .. } => "clear_result",
            DaemonEvent::PrActionResult { .. } => "pr_action_result",
            DaemonEvent::PrsUpdated { .. } => "prs_updated",
            DaemonEvent::SettingsUpdated { .. } => "settings_updated",
            DaemonEvent::RecentLocationsUpdated { .. } => "recent_locations_updated",
            DaemonEvent::StorageDegraded { .. } => "storage_degraded",
            DaemonEvent::CommandError { .. } => "command_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_wire_format() {
        let evt = DaemonEvent::CommandError {
            cmd: "spawn_session".to_string(),
            code: "daemon_recovering".to_string(),
            message: "recovery in progress".to_string(),
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""event":"command_error""#));
        assert!(json.contains(r#""cmd":"spawn_session""#));
        assert!(json.contains(r#""code":"daemon_recovering""#));
    }

    #[test]
    fn test_initial_state_roundtrip() {
        let evt = DaemonEvent::InitialState {
            protocol_version: "3".to_string(),
            daemon_instance_id: "d-1".to_string(),
            sessions: vec![],
            prs: vec![],
            repo_mutes: vec!["owner/noisy".to_string()],
            author_mutes: vec![],
            settings: UserSettings::default(),
            recent_locations: vec![],
            warnings: vec![],
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""protocol_version":"3""#));
        // Empty warnings are omitted from the wire.
        assert!(!json.contains("warnings"));
        let parsed: DaemonEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name(), "initial_state");
    }

    #[test]
    fn test_pty_output_roundtrip() {
        let evt = DaemonEvent::PtyOutput {
            session_id: "s1".to_string(),
            data: "dG90YWwgNDgK".to_string(),
            seq: 42,
        };
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: DaemonEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            DaemonEvent::PtyOutput {
                session_id,
                data,
                seq,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(data, "dG90YWwgNDgK");
                assert_eq!(seq, 42);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_pr_action_result_echoes_id() {
        let evt = DaemonEvent::PrActionResult {
            id: "owner/repo#7".to_string(),
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""id":"owner/repo#7""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_session_exited_reason() {
        let evt = DaemonEvent::SessionExited {
            session_id: "s1".to_string(),
            exit_code: None,
            signal: None,
            reason: Some("worker_unreachable".to_string()),
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("worker_unreachable"));
        assert!(!json.contains("exit_code"));
    }
}
