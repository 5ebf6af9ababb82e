//! Control socket (`attn.sock`).
//!
//! Hook subprocesses post lifecycle events here as plain JSONL; the CLI
//! uses it for `list` and `status`. Replies are immediate — a hook must
//! never block the agent it runs inside, so classifier work is spawned
//! off the connection task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use attn_core::classifier::{ClassifierPipeline, TriggerSource};
use attn_core::sessions::{NewSession, SessionEngine};
use attn_protocol::codec::{read_message, write_message};
use attn_protocol::hook::{HookMessage, HookReply};
use attn_protocol::types::{AgentKind, DaemonStatusInfo, SessionState};
use attn_protocol::PROTOCOL_VERSION;
use chrono::Utc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::barrier::RecoveryGate;
use crate::errors::DaemonError;

/// Ask the watcher manager to tail a transcript for a session.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct ControlState {
    pub engine: Arc<SessionEngine>,
    pub classifier: Arc<ClassifierPipeline>,
    pub gate: RecoveryGate,
    pub instance_id: String,
    pub started_at: Instant,
    pub degraded: bool,
    pub watch_tx: mpsc::UnboundedSender<WatchRequest>,
}

pub async fn run_control_socket(
    socket_path: PathBuf,
    state: ControlState,
    cancel: CancellationToken,
) -> Result<(), DaemonError> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(
        event = "daemon.control.listening",
        socket = %socket_path.display(),
    );

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_connection(stream, state.clone()));
                    }
                    Err(e) => {
                        error!(event = "daemon.control.accept_failed", error = %e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!(event = "daemon.control.shutdown");
                if let Err(e) = std::fs::remove_file(&socket_path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(event = "daemon.control.socket_cleanup_failed", error = %e);
                }
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: ControlState) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);

    loop {
        let message: Option<HookMessage> = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(e) => {
                debug!(event = "daemon.control.read_failed", error = %e);
                let _ = write_message(&mut write_half, &HookReply::err(e.to_string())).await;
                return;
            }
        };
        let Some(message) = message else {
            return; // EOF
        };
        let reply = handle_message(&state, message);
        if write_message(&mut write_half, &reply).await.is_err() {
            return;
        }
    }
}

fn handle_message(state: &ControlState, message: HookMessage) -> HookReply {
    match message {
        HookMessage::State {
            session_id,
            state: state_str,
            timestamp,
        } => {
            let Some(new_state) = SessionState::parse(&state_str) else {
                return HookReply::err(format!("unknown state: {state_str}"));
            };
            let at = timestamp.unwrap_or_else(Utc::now);
            // Stale updates are rejected by the monotonic guard; that is
            // normal operation, not an error the hook can act on.
            state.engine.update_state_if_newer(&session_id, new_state, at);
            HookReply::ok()
        }

        HookMessage::Todos { session_id, todos } => {
            match state.engine.update_todos(&session_id, todos) {
                Ok(()) => HookReply::ok(),
                Err(e) => HookReply::err(e.to_string()),
            }
        }

        HookMessage::Stop {
            session_id,
            turn_uuid,
            agent_session_id,
            transcript_path,
            timestamp,
        } => {
            if let Some(agent_sid) = &agent_session_id
                && let Err(e) = state.engine.set_resume_session_id(&session_id, agent_sid)
            {
                debug!(
                    event = "daemon.control.resume_id_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
            let path = transcript_path.map(PathBuf::from);
            let _ = state.watch_tx.send(WatchRequest {
                session_id: session_id.clone(),
                transcript_path: path.clone(),
            });

            let classifier = state.classifier.clone();
            let trigger_time = timestamp.unwrap_or_else(Utc::now);
            tokio::spawn(async move {
                classifier
                    .classify_end_of_turn(
                        &session_id,
                        turn_uuid.as_deref(),
                        path.as_deref(),
                        trigger_time,
                        TriggerSource::HookStop,
                    )
                    .await;
            });
            HookReply::ok()
        }

        HookMessage::Register {
            session_id,
            cwd,
            agent,
            label,
        } => {
            let Some(agent) = AgentKind::parse(&agent) else {
                return HookReply::err(format!("unknown agent kind: {agent}"));
            };
            // Wrapper restarts re-register; that is idempotent.
            if state.engine.get(&session_id).is_some() {
                return HookReply::ok();
            }
            match state.engine.register(NewSession {
                id: session_id,
                label,
                cwd,
                agent,
                state: SessionState::Launching,
                branch: None,
                worktree: None,
                agent_available: true,
            }) {
                Ok(_) => HookReply::ok(),
                Err(e) => HookReply::err(e.to_string()),
            }
        }

        HookMessage::Unregister { session_id } => {
            match state.engine.unregister(&session_id) {
                Ok(()) => HookReply::ok(),
                Err(e) => HookReply::err(e.to_string()),
            }
        }

        HookMessage::List => HookReply {
            ok: true,
            error: None,
            sessions: Some(state.engine.list()),
            status: None,
        },

        HookMessage::Status => HookReply {
            ok: true,
            error: None,
            sessions: None,
            status: Some(DaemonStatusInfo {
                pid: std::process::id(),
                uptime_secs: state.started_at.elapsed().as_secs(),
                session_count: state.engine.count(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                daemon_instance_id: state.instance_id.clone(),
                recovering: !state.gate.is_lifted(),
                degraded: state.degraded,
            }),
        },
    }
}
