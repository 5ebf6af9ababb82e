use std::path::PathBuf;

use attn_protocol::types::{AgentKind, SessionState};
use tokio::sync::mpsc;

/// Parameters for spawning a PTY session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub session_id: String,
    pub cwd: PathBuf,
    pub agent: AgentKind,
    /// Program to run; `None` means the agent executable (or the user's
    /// default shell for `shell` sessions).
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Events delivered on a subscriber's attach stream.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    Output { bytes: Vec<u8>, seq: u64 },
    Desync { reason: String },
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

/// Session exit notification from the backend (real or synthesized).
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub session_id: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    /// Set for synthesized exits, e.g. `worker_unreachable`.
    pub reason: Option<String>,
}

/// Heuristic state hint from PTY output scanning.
#[derive(Debug, Clone)]
pub struct StateHintEvent {
    pub session_id: String,
    pub state: SessionState,
}

/// Lifecycle callbacks a backend reports into, fixed at construction.
/// Always delivered asynchronously: callers must never re-enter backend
/// methods from the sending side.
#[derive(Clone)]
pub struct BackendEvents {
    pub exit_tx: mpsc::UnboundedSender<ExitEvent>,
    pub state_tx: mpsc::UnboundedSender<StateHintEvent>,
}

/// Outcome of a recovery scan.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Sessions re-registered from live workers.
    pub recovered: Vec<String>,
    /// Registry entries removed (dead worker, successful reclaim).
    pub pruned: Vec<String>,
    /// Entries moved aside with a reason.
    pub quarantined: Vec<(String, String)>,
    /// Entries left for the deferred reconciler (transient failures).
    pub deferred: Vec<String>,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: RecoveryReport) {
        self.recovered.extend(other.recovered);
        self.pruned.extend(other.pruned);
        self.quarantined.extend(other.quarantined);
        self.deferred.extend(other.deferred);
    }
}
