//! The session state engine.
//!
//! Owns session metadata and the single committed path for state
//! transitions: `update_state_if_newer`. Every producer — hook events,
//! PTY heuristics, classifier verdicts, recovery reconciliation — funnels
//! through its strict timestamp guard, so late or duplicated updates
//! cannot reorder state. Store writes are best-effort: failures are
//! logged and swallowed, never propagated into hot paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use attn_protocol::types::{AgentKind, SessionSnapshot, SessionState, TodoItem};
use attn_store::Store;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::Session;
use crate::errors::SessionError;
use crate::heuristics;

/// Bound on the remembered classified-turn UUIDs per engine.
const TURN_LEDGER_CAP: usize = 256;

/// State-engine events broadcast to the gateway.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Registered(SessionSnapshot),
    /// Metadata change (label, resume id) for an existing session.
    Updated(SessionSnapshot),
    StateChanged {
        session_id: String,
        state: SessionState,
        state_since: DateTime<Utc>,
        state_updated_at: DateTime<Utc>,
    },
    TodosUpdated {
        session_id: String,
        todos: Vec<TodoItem>,
    },
    Unregistered {
        session_id: String,
    },
}

/// Parameters for registering a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub label: Option<String>,
    pub cwd: String,
    pub agent: AgentKind,
    pub state: SessionState,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub agent_available: bool,
}

pub struct SessionEngine {
    sessions: Mutex<HashMap<String, Session>>,
    store: Arc<Store>,
    events: broadcast::Sender<EngineEvent>,
    classified_turns: Mutex<TurnLedger>,
}

impl SessionEngine {
    pub fn new(store: Arc<Store>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            events,
            classified_turns: Mutex::new(TurnLedger::new(TURN_LEDGER_CAP)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new session. Fails if the id is taken or malformed.
    pub fn register(&self, new: NewSession) -> Result<SessionSnapshot, SessionError> {
        if !attn_paths::is_valid_session_id(&new.id) {
            return Err(SessionError::InvalidId(new.id));
        }
        let now = Utc::now();
        let session = Session {
            label: new.label.unwrap_or_else(|| new.id.clone()),
            id: new.id,
            cwd: new.cwd,
            agent: new.agent,
            state: new.state,
            state_since: now,
            state_updated_at: now,
            todos: vec![],
            branch: new.branch,
            worktree: new.worktree,
            resume_session_id: None,
            agent_available: new.agent_available,
            created_at: now,
            launched_at: now,
        };
        let snapshot = session.snapshot();
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&session.id) {
                return Err(SessionError::AlreadyExists(session.id));
            }
            sessions.insert(session.id.clone(), session);
        }
        self.persist_upsert(&snapshot);
        info!(
            event = "core.session.registered",
            session_id = %snapshot.id,
            agent = %snapshot.agent,
            state = %snapshot.state,
        );
        let _ = self.events.send(EngineEvent::Registered(snapshot.clone()));
        Ok(snapshot)
    }

    /// Insert a session recovered at startup without emitting events;
    /// clients have not received `initial_state` yet.
    pub fn adopt(&self, session: Session) {
        let snapshot = session.snapshot();
        self.lock_sessions().insert(session.id.clone(), session);
        self.persist_upsert(&snapshot);
        debug!(event = "core.session.adopted", session_id = %snapshot.id);
    }

    pub fn unregister(&self, session_id: &str) -> Result<(), SessionError> {
        let removed = self.lock_sessions().remove(session_id);
        if removed.is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if let Err(e) = self.store.remove_session(session_id) {
            warn!(
                event = "core.session.store_remove_failed",
                session_id = session_id,
                error = %e,
            );
        }
        info!(event = "core.session.unregistered", session_id = session_id);
        let _ = self.events.send(EngineEvent::Unregistered {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// The single committed path for state transitions.
    ///
    /// Atomically rejects any update whose timestamp is not strictly
    /// after the stored `state_updated_at`, then writes the state, both
    /// timestamps, and emits `session_state_changed`. Guards against late
    /// classifier results overwriting newer hook events and duplicate
    /// hook firings.
    pub fn update_state_if_newer(
        &self,
        session_id: &str,
        state: SessionState,
        updated_at: DateTime<Utc>,
    ) -> bool {
        let event = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(session_id) else {
                debug!(
                    event = "core.session.state_update_unknown_session",
                    session_id = session_id,
                );
                return false;
            };
            if updated_at <= session.state_updated_at {
                debug!(
                    event = "core.session.state_update_rejected_stale",
                    session_id = session_id,
                    proposed = %state,
                    proposed_at = %updated_at,
                    current_at = %session.state_updated_at,
                );
                return false;
            }
            if session.state != state {
                session.state = state;
                session.state_since = updated_at;
            }
            session.state_updated_at = updated_at;
            EngineEvent::StateChanged {
                session_id: session_id.to_string(),
                state: session.state,
                state_since: session.state_since,
                state_updated_at: session.state_updated_at,
            }
        };
        if let EngineEvent::StateChanged {
            state,
            state_since,
            state_updated_at,
            ..
        } = &event
        {
            if let Err(e) =
                self.store
                    .update_session_state(session_id, *state, *state_since, *state_updated_at)
            {
                warn!(
                    event = "core.session.store_state_failed",
                    session_id = session_id,
                    error = %e,
                );
            }
        }
        info!(
            event = "core.session.state_changed",
            session_id = session_id,
            state = %state,
        );
        let _ = self.events.send(event);
        true
    }

    /// Apply a PTY-output heuristic hint, subject to the admission rules.
    pub fn apply_heuristic(&self, session_id: &str, hint: SessionState) -> bool {
        let (current, agent) = {
            let sessions = self.lock_sessions();
            let Some(session) = sessions.get(session_id) else {
                return false;
            };
            (session.state, session.agent)
        };
        if !heuristics::admit_heuristic(current, agent, hint) {
            debug!(
                event = "core.session.heuristic_suppressed",
                session_id = session_id,
                current = %current,
                hint = %hint,
            );
            return false;
        }
        self.update_state_if_newer(session_id, hint, Utc::now())
    }

    pub fn update_todos(
        &self,
        session_id: &str,
        todos: Vec<TodoItem>,
    ) -> Result<(), SessionError> {
        {
            let mut sessions = self.lock_sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            session.todos = todos.clone();
        }
        if let Err(e) = self.store.update_session_todos(session_id, &todos) {
            warn!(
                event = "core.session.store_todos_failed",
                session_id = session_id,
                error = %e,
            );
        }
        let _ = self.events.send(EngineEvent::TodosUpdated {
            session_id: session_id.to_string(),
            todos,
        });
        Ok(())
    }

    /// Record the agent-native resume handle discovered from hook stdin.
    pub fn set_resume_session_id(
        &self,
        session_id: &str,
        resume_session_id: &str,
    ) -> Result<(), SessionError> {
        let snapshot = {
            let mut sessions = self.lock_sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            if session.resume_session_id.as_deref() == Some(resume_session_id) {
                return Ok(());
            }
            session.resume_session_id = Some(resume_session_id.to_string());
            session.snapshot()
        };
        if let Err(e) = self.store.set_session_resume_id(session_id, resume_session_id) {
            warn!(
                event = "core.session.store_resume_failed",
                session_id = session_id,
                error = %e,
            );
        }
        let _ = self.events.send(EngineEvent::Updated(snapshot));
        Ok(())
    }

    pub fn set_label(&self, session_id: &str, label: &str) -> Result<(), SessionError> {
        let snapshot = {
            let mut sessions = self.lock_sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            session.label = label.to_string();
            session.snapshot()
        };
        if let Err(e) = self.store.set_session_label(session_id, label) {
            warn!(
                event = "core.session.store_label_failed",
                session_id = session_id,
                error = %e,
            );
        }
        let _ = self.events.send(EngineEvent::Updated(snapshot));
        Ok(())
    }

    /// Advance the monotonic guard to now without changing state.
    ///
    /// Called when the user acts on a session (sends input), so that
    /// classifier verdicts triggered before the action can no longer
    /// commit.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(session_id) {
            session.state_updated_at = Utc::now();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock_sessions().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .lock_sessions()
            .values()
            .map(Session::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.lock_sessions().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn has_session_in_directory(&self, dir: &str) -> bool {
        self.lock_sessions().values().any(|s| s.cwd == dir)
    }

    /// Turn-idempotency check: returns true when this turn UUID was
    /// already classified (and records it otherwise).
    pub fn already_classified(&self, session_id: &str, turn_uuid: &str) -> bool {
        let key = format!("{session_id}\u{0}{turn_uuid}");
        match self.classified_turns.lock() {
            Ok(mut ledger) => !ledger.insert(key),
            Err(poisoned) => !poisoned.into_inner().insert(key),
        }
    }

    fn persist_upsert(&self, snapshot: &SessionSnapshot) {
        if let Err(e) = self.store.upsert_session(snapshot) {
            warn!(
                event = "core.session.store_upsert_failed",
                session_id = %snapshot.id,
                error = %e,
            );
        }
    }
}

/// Bounded insert-only set of recently classified turn keys.
struct TurnLedger {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl TurnLedger {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns false when the key was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.cap
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}
