use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DaemonStatusInfo, SessionSnapshot, TodoItem};

/// Messages accepted on the control socket (`attn.sock`).
///
/// Hook subprocesses post lifecycle events here; the CLI uses `list` and
/// `status`. Plain JSONL, one message per line, one reply per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HookMessage {
    /// Direct state report from a hook (e.g. permission prompt shown).
    State {
        session_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Todo list update relayed from the agent.
    Todos {
        session_id: String,
        todos: Vec<TodoItem>,
    },

    /// End-of-turn stop event; triggers the classifier.
    Stop {
        session_id: String,
        /// Agent-assigned turn UUID, when the hook payload carries one.
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_uuid: Option<String>,
        /// Agent-native session id usable for `--resume`.
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Register an externally-launched (wrapper) session.
    Register {
        session_id: String,
        cwd: String,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    Unregister {
        session_id: String,
    },

    List,

    Status,
}

/// Reply to a control-socket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSnapshot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DaemonStatusInfo>,
}

impl HookReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            sessions: None,
            status: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            sessions: None,
            status: None,
        }
    }
}
