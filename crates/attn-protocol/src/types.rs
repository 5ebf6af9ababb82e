use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a newtype wrapper around `String` with standard trait impls.
///
/// Each generated type gets: `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`,
/// `Serialize`/`Deserialize` (transparent), `Display`, `Deref<Target=str>`,
/// `AsRef<str>`, `Borrow<str>`, `From<String>`, `From<&str>`.
macro_rules! newtype_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_string! {
    /// Opaque identifier for a managed session.
    SessionId
}

/// Lifecycle state of a managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Spawn accepted, runtime signals not yet received.
    Launching,
    /// Agent producing output or mid-turn.
    Working,
    /// Agent awaiting a user reply.
    WaitingInput,
    /// Agent blocked on a permission prompt.
    PendingApproval,
    /// Turn complete, no pending request.
    Idle,
    /// Classifier uncertain or errored.
    Unknown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Launching => "launching",
            SessionState::Working => "working",
            SessionState::WaitingInput => "waiting_input",
            SessionState::PendingApproval => "pending_approval",
            SessionState::Idle => "idle",
            SessionState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "launching" => Some(SessionState::Launching),
            "working" => Some(SessionState::Working),
            "waiting_input" => Some(SessionState::WaitingInput),
            "pending_approval" => Some(SessionState::PendingApproval),
            "idle" => Some(SessionState::Idle),
            "unknown" => Some(SessionState::Unknown),
            _ => None,
        }
    }

    /// States that should surface in the "needs you" section of a client.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            SessionState::WaitingInput | SessionState::PendingApproval
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Supported agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Copilot,
    Shell,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Copilot => "copilot",
            AgentKind::Shell => "shell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "claude" => Some(AgentKind::Claude),
            "codex" => Some(AgentKind::Codex),
            "copilot" => Some(AgentKind::Copilot),
            "shell" => Some(AgentKind::Shell),
            _ => None,
        }
    }

    pub fn all() -> &'static [AgentKind] {
        &[
            AgentKind::Claude,
            AgentKind::Codex,
            AgentKind::Copilot,
            AgentKind::Shell,
        ]
    }

    /// Whether end-of-turn truth comes from the transcript rather than
    /// hook events. Affects which PTY heuristics are admitted.
    pub fn transcript_authoritative(&self) -> bool {
        matches!(self, AgentKind::Codex | AgentKind::Copilot)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::parse(s).ok_or_else(|| format!("unknown agent kind: {s}"))
    }
}

/// One entry of a session's todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// Wire representation of a managed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub label: String,
    pub cwd: String,
    pub agent: AgentKind,
    pub state: SessionState,
    /// When the state last changed value.
    pub state_since: DateTime<Utc>,
    /// Monotonic guard for out-of-order updates.
    pub state_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<TodoItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    /// Agent-native resume handle discovered from hook stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    /// Whether the agent's executable resolved on this machine.
    #[serde(default)]
    pub agent_available: bool,
    pub created_at: DateTime<Utc>,
}

/// Serialized virtual-terminal screen used to restore full-screen agent
/// UIs on attach. Rows carry their SGR escape sequences, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub alternate_screen: bool,
    /// One base64 entry per screen row, formatted with attributes.
    pub lines: Vec<String>,
    /// False when the snapshot may lag the live stream (rebuilt state).
    pub fresh: bool,
}

/// Payload returned to a subscriber on attach, ahead of the live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachInfo {
    /// Base64 scrollback replay.
    pub scrollback: String,
    /// True when the ring evicted data before this replay.
    pub scrollback_truncated: bool,
    /// Sequence number of the last byte chunk included in the replay.
    pub last_seq: u64,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenSnapshot>,
}

/// Cached read-model of one external pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrInfo {
    /// Stable identifier, `<repo>#<number>`.
    pub id: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub url: String,
    pub head_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_status: Option<String>,
    pub comment_count: u64,
    pub state: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub has_new_changes: bool,
}

/// User-tunable settings persisted in the store and served on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<AgentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            default_agent: None,
            theme: None,
        }
    }
}

/// A directory the user recently launched a session from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentLocation {
    pub path: String,
    pub last_used_at: DateTime<Utc>,
}

/// Runtime status of the daemon, served over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatusInfo {
    pub pid: u32,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub protocol_version: String,
    pub daemon_instance_id: String,
    pub recovering: bool,
    pub degraded: bool,
}
