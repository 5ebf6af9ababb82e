use serde::{Deserialize, Serialize};

use crate::types::UserSettings;

/// Client -> Daemon commands over the WebSocket.
///
/// Each variant maps to a JSON message with `"cmd"` as the tag field.
/// Commands that can fail asynchronously are answered by a `*_result`
/// event echoing their correlation keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    #[serde(rename = "spawn_session")]
    SpawnSession {
        /// Session id chosen by the client (correlation key).
        id: String,
        cwd: String,
        agent: String,
        cols: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Override for the command launched inside the PTY.
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },

    #[serde(rename = "attach_session")]
    AttachSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    #[serde(rename = "detach_session")]
    DetachSession { session_id: String },

    #[serde(rename = "pty_input")]
    PtyInput {
        session_id: String,
        /// Base64-encoded bytes for PTY stdin.
        data: String,
    },

    #[serde(rename = "pty_resize")]
    PtyResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    #[serde(rename = "kill_session")]
    KillSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    #[serde(rename = "clear_sessions")]
    ClearSessions {},

    #[serde(rename = "unregister_session")]
    UnregisterSession { session_id: String },

    #[serde(rename = "set_session_label")]
    SetSessionLabel { session_id: String, label: String },

    #[serde(rename = "mute_pr")]
    MutePr { id: String, muted: bool },

    #[serde(rename = "mute_repo")]
    MuteRepo { repo: String, muted: bool },

    #[serde(rename = "mute_author")]
    MuteAuthor { author: String, muted: bool },

    #[serde(rename = "mark_pr_seen")]
    MarkPrSeen { id: String },

    #[serde(rename = "update_settings")]
    UpdateSettings { settings: UserSettings },

    #[serde(rename = "add_recent_location")]
    AddRecentLocation { path: String },
}

impl ClientCommand {
    /// The wire name of this command, echoed in `command_error`.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::SpawnSession { .. } => "spawn_session",
            ClientCommand::AttachSession { .. } => "attach_session",
            ClientCommand::DetachSession { .. } => "detach_session",
            ClientCommand::PtyInput { .. } => "pty_input",
            ClientCommand::PtyResize { .. } => "pty_resize",
            ClientCommand::KillSession { .. } => "kill_session",
            ClientCommand::ClearSessions {} => "clear_sessions",
            ClientCommand::UnregisterSession { .. } => "unregister_session",
            ClientCommand::SetSessionLabel { .. } => "set_session_label",
            ClientCommand::MutePr { .. } => "mute_pr",
            ClientCommand::MuteRepo { .. } => "mute_repo",
            ClientCommand::MuteAuthor { .. } => "mute_author",
            ClientCommand::MarkPrSeen { .. } => "mark_pr_seen",
            ClientCommand::UpdateSettings { .. } => "update_settings",
            ClientCommand::AddRecentLocation { .. } => "add_recent_location",
        }
    }

    /// PTY-lifecycle commands refused while the recovery barrier is up.
    pub fn gated_by_recovery(&self) -> bool {
        matches!(
            self,
            ClientCommand::SpawnSession { .. }
                | ClientCommand::AttachSession { .. }
                | ClientCommand::DetachSession { .. }
                | ClientCommand::PtyInput { .. }
                | ClientCommand::PtyResize { .. }
                | ClientCommand::KillSession { .. }
                | ClientCommand::ClearSessions {}
                | ClientCommand::UnregisterSession { .. }
        )
    }

    /// High-frequency commands exempt from command logging.
    pub fn log_exempt(&self) -> bool {
        matches!(
            self,
            ClientCommand::PtyInput { .. }
                | ClientCommand::PtyResize { .. }
                | ClientCommand::AttachSession { .. }
                | ClientCommand::DetachSession { .. }
        )
    }
}
