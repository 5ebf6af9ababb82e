//! Session persistence. State transitions are decided by the session
//! engine; the store just records them.

use attn_protocol::types::{
    AgentKind, SessionId, SessionSnapshot, SessionState, TodoItem,
};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use crate::{Store, StoreError};

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<SessionSnapshot> {
    let todos_json: String = row.get("todos")?;
    let todos: Vec<TodoItem> = serde_json::from_str(&todos_json).unwrap_or_default();
    let agent_str: String = row.get("agent")?;
    let state_str: String = row.get("state")?;
    Ok(SessionSnapshot {
        id: SessionId::new(row.get::<_, String>("id")?),
        label: row.get("label")?,
        cwd: row.get("cwd")?,
        agent: AgentKind::parse(&agent_str).unwrap_or(AgentKind::Shell),
        state: SessionState::parse(&state_str).unwrap_or(SessionState::Unknown),
        state_since: parse_ts(row, "state_since")?,
        state_updated_at: parse_ts(row, "state_updated_at")?,
        todos,
        branch: row.get("branch")?,
        worktree: row.get("worktree")?,
        resume_session_id: row.get("resume_session_id")?,
        agent_available: false,
        created_at: parse_ts(row, "created_at")?,
    })
}

fn parse_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    Ok(raw
        .parse::<DateTime<Utc>>()
        .unwrap_or_else(|_| Utc::now()))
}

impl Store {
    /// Upsert a session by id. Detail columns the snapshot carries win;
    /// nothing outside the listed columns is touched.
    pub fn upsert_session(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let todos = serde_json::to_string(&snapshot.todos)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (
                id, label, cwd, agent, state, state_since, state_updated_at,
                todos, branch, worktree, resume_session_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                cwd = excluded.cwd,
                agent = excluded.agent,
                state = excluded.state,
                state_since = excluded.state_since,
                state_updated_at = excluded.state_updated_at,
                todos = excluded.todos,
                branch = excluded.branch,
                worktree = excluded.worktree,
                resume_session_id = COALESCE(excluded.resume_session_id, sessions.resume_session_id)",
            params![
                &*snapshot.id,
                snapshot.label,
                snapshot.cwd,
                snapshot.agent.as_str(),
                snapshot.state.as_str(),
                snapshot.state_since.to_rfc3339(),
                snapshot.state_updated_at.to_rfc3339(),
                todos,
                snapshot.branch,
                snapshot.worktree,
                snapshot.resume_session_id,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
        state_since: DateTime<Utc>,
        state_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET state = ?2, state_since = ?3, state_updated_at = ?4 WHERE id = ?1",
            params![
                session_id,
                state.as_str(),
                state_since.to_rfc3339(),
                state_updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_session_todos(
        &self,
        session_id: &str,
        todos: &[TodoItem],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(todos)?;
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET todos = ?2 WHERE id = ?1",
            params![session_id, json],
        )?;
        Ok(())
    }

    pub fn set_session_resume_id(
        &self,
        session_id: &str,
        resume_session_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET resume_session_id = ?2 WHERE id = ?1",
            params![session_id, resume_session_id],
        )?;
        Ok(())
    }

    pub fn set_session_label(&self, session_id: &str, label: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET label = ?2 WHERE id = ?1",
            params![session_id, label],
        )?;
        Ok(())
    }

    pub fn remove_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(n > 0)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        let conn = self.lock();
        let snapshot = conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn load_sessions(&self) -> Result<Vec<SessionSnapshot>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY created_at")?;
        let sessions = stmt
            .query_map([], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn clear_sessions(&self) -> Result<usize, StoreError> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM sessions", [])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, state: SessionState) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            id: SessionId::new(id),
            label: format!("label-{id}"),
            cwd: "/tmp/project".to_string(),
            agent: AgentKind::Claude,
            state,
            state_since: now,
            state_updated_at: now,
            todos: vec![],
            branch: Some("feature".to_string()),
            worktree: None,
            resume_session_id: None,
            agent_available: false,
            created_at: now,
        }
    }

    #[test]
    fn test_upsert_and_load() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Launching)).unwrap();
        store.upsert_session(&snapshot("s2", SessionState::Working)).unwrap();

        let sessions = store.load_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let ids: Vec<&str> = sessions.iter().map(|s| &*s.id as &str).collect();
        assert!(ids.contains(&"s1"));
        assert!(ids.contains(&"s2"));
    }

    #[test]
    fn test_upsert_same_id_replaces() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Launching)).unwrap();
        let mut updated = snapshot("s1", SessionState::Working);
        updated.label = "renamed".to_string();
        store.upsert_session(&updated).unwrap();

        let sessions = store.load_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].label, "renamed");
        assert_eq!(sessions[0].state, SessionState::Working);
    }

    #[test]
    fn test_upsert_preserves_resume_id_when_absent() {
        let store = Store::open_in_memory().unwrap();
        let mut first = snapshot("s1", SessionState::Working);
        first.resume_session_id = Some("native-1".to_string());
        store.upsert_session(&first).unwrap();

        // A later upsert without a resume id must not erase the stored one.
        store.upsert_session(&snapshot("s1", SessionState::Idle)).unwrap();
        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.resume_session_id.as_deref(), Some("native-1"));
    }

    #[test]
    fn test_update_state() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Working)).unwrap();
        let at = Utc::now();
        store
            .update_session_state("s1", SessionState::WaitingInput, at, at)
            .unwrap();
        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::WaitingInput);
    }

    #[test]
    fn test_update_todos_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Working)).unwrap();
        let todos = vec![
            TodoItem {
                text: "write tests".to_string(),
                completed: true,
            },
            TodoItem {
                text: "fix bug".to_string(),
                completed: false,
            },
        ];
        store.update_session_todos("s1", &todos).unwrap();
        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.todos, todos);
    }

    #[test]
    fn test_remove_session() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Idle)).unwrap();
        assert!(store.remove_session("s1").unwrap());
        assert!(!store.remove_session("s1").unwrap());
        assert!(store.get_session("s1").unwrap().is_none());
    }

    #[test]
    fn test_clear_sessions() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&snapshot("s1", SessionState::Idle)).unwrap();
        store.upsert_session(&snapshot("s2", SessionState::Idle)).unwrap();
        assert_eq!(store.clear_sessions().unwrap(), 2);
        assert!(store.load_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_sessions_survive_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attn.db");
        {
            let store = Store::open(&db).unwrap();
            store.upsert_session(&snapshot("s1", SessionState::WaitingInput)).unwrap();
        }
        let store = Store::open(&db).unwrap();
        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::WaitingInput);
    }
}
