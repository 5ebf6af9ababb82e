mod engine;

pub use engine::{EngineEvent, NewSession, SessionEngine};

use attn_protocol::types::{
    AgentKind, SessionId, SessionSnapshot, SessionState, TodoItem,
};
use chrono::{DateTime, Utc};

/// A managed session's metadata. Runtime (PTY) state lives in the backend;
/// this is the state-engine side of the split.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub label: String,
    pub cwd: String,
    pub agent: AgentKind,
    pub state: SessionState,
    pub state_since: DateTime<Utc>,
    pub state_updated_at: DateTime<Utc>,
    pub todos: Vec<TodoItem>,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub resume_session_id: Option<String>,
    pub agent_available: bool,
    pub created_at: DateTime<Utc>,
    /// When this daemon first saw the session; anchors Copilot transcript
    /// discovery.
    pub launched_at: DateTime<Utc>,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: SessionId::new(&self.id),
            label: self.label.clone(),
            cwd: self.cwd.clone(),
            agent: self.agent,
            state: self.state,
            state_since: self.state_since,
            state_updated_at: self.state_updated_at,
            todos: self.todos.clone(),
            branch: self.branch.clone(),
            worktree: self.worktree.clone(),
            resume_session_id: self.resume_session_id.clone(),
            agent_available: self.agent_available,
            created_at: self.created_at,
        }
    }

    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            id: snapshot.id.to_string(),
            label: snapshot.label.clone(),
            cwd: snapshot.cwd.clone(),
            agent: snapshot.agent,
            state: snapshot.state,
            state_since: snapshot.state_since,
            state_updated_at: snapshot.state_updated_at,
            todos: snapshot.todos.clone(),
            branch: snapshot.branch.clone(),
            worktree: snapshot.worktree.clone(),
            resume_session_id: snapshot.resume_session_id.clone(),
            agent_available: snapshot.agent_available,
            created_at: snapshot.created_at,
            launched_at: Utc::now(),
        }
    }
}
