//! Embedded backend: PTYs inside the daemon process.
//!
//! Opt-in via `ATTN_PTY_BACKEND=embedded` for debugging. Sessions cannot
//! survive a daemon restart, and `shutdown` kills every child.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use attn_protocol::types::AttachInfo;
use attn_protocol::worker::WorkerSessionInfo;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BackendContext, PtyBackend};
use crate::errors::DaemonError;
use crate::runtime::{PtySessionRuntime, RuntimeEvent};
use crate::types::{BackendEvents, ExitEvent, PtyEvent, RecoveryReport, SpawnOptions, StateHintEvent};

struct EmbeddedSession {
    runtime: Arc<PtySessionRuntime>,
    subscribers: HashMap<String, CancellationToken>,
}

pub struct EmbeddedBackend {
    ctx: BackendContext,
    sessions: RwLock<HashMap<String, EmbeddedSession>>,
}

impl EmbeddedBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn capture_path(&self, session_id: &str) -> Option<std::path::PathBuf> {
        if !self.ctx.config.debug_capture_enabled {
            return None;
        }
        Some(
            self.ctx
                .paths
                .worker_captures_dir(&self.ctx.instance_id)
                .join(format!("{session_id}-{}.cap", chrono::Utc::now().timestamp())),
        )
    }
}

#[async_trait]
impl PtyBackend for EmbeddedBackend {
    async fn spawn(&self, opts: SpawnOptions) -> Result<(), DaemonError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&opts.session_id) {
            return Err(DaemonError::SessionAlreadyExists(opts.session_id));
        }

        let runtime = Arc::new(PtySessionRuntime::spawn(
            &opts,
            self.ctx.config.scrollback_bytes,
            self.ctx.config.subscriber_buffer_messages,
            self.capture_path(&opts.session_id),
        )?);

        // Lifecycle forwarder: exit and heuristic hints to the daemon.
        spawn_lifecycle_forwarder(
            opts.session_id.clone(),
            runtime.subscribe(),
            self.ctx.events.clone(),
        );

        sessions.insert(
            opts.session_id.clone(),
            EmbeddedSession {
                runtime,
                subscribers: HashMap::new(),
            },
        );
        info!(
            event = "daemon.backend.embedded_spawned",
            session_id = %opts.session_id,
        );
        Ok(())
    }

    async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachInfo, mpsc::Receiver<PtyEvent>), DaemonError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;

        // Re-attach closes the previous stream first.
        if let Some(previous) = session
            .subscribers
            .insert(subscriber_id.to_string(), CancellationToken::new())
        {
            previous.cancel();
        }
        let cancel = session.subscribers[subscriber_id].clone();

        let (info, events) = session.runtime.attach_snapshot();
        let (tx, rx) = mpsc::channel(self.ctx.config.subscriber_buffer_messages);
        tokio::spawn(forward_subscriber_events(events, tx, cancel));
        Ok((info, rx))
    }

    async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), DaemonError> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id)
            && let Some(token) = session.subscribers.remove(subscriber_id)
        {
            token.cancel();
        }
        Ok(())
    }

    async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), DaemonError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        session.runtime.input(bytes)
    }

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), DaemonError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        session.runtime.resize(cols, rows)
    }

    async fn kill(&self, session_id: &str, signal: Option<&str>) -> Result<(), DaemonError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        session.runtime.kill(signal)
    }

    async fn remove(&self, session_id: &str) -> Result<(), DaemonError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .remove(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        for (_, token) in session.subscribers {
            token.cancel();
        }
        if session.runtime.is_running()
            && let Err(e) = session.runtime.kill(None)
        {
            warn!(
                event = "daemon.backend.embedded_remove_kill_failed",
                session_id = session_id,
                error = %e,
            );
        }
        Ok(())
    }

    async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn session_info(&self, session_id: &str) -> Result<WorkerSessionInfo, DaemonError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
        Ok(session.runtime.info())
    }

    async fn session_likely_alive(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .is_some_and(|s| s.runtime.is_running())
    }

    async fn recover(&self) -> RecoveryReport {
        // Nothing persists across restarts in the embedded backend.
        RecoveryReport::default()
    }

    async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (session_id, session) in sessions.drain() {
            for (_, token) in session.subscribers {
                token.cancel();
            }
            if session.runtime.is_running()
                && let Err(e) = session.runtime.kill(None)
            {
                warn!(
                    event = "daemon.backend.embedded_shutdown_kill_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }
    }
}

fn spawn_lifecycle_forwarder(
    session_id: String,
    mut rx: tokio::sync::broadcast::Receiver<RuntimeEvent>,
    events: BackendEvents,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(RuntimeEvent::Exit { exit_code, signal }) => {
                    let _ = events.exit_tx.send(ExitEvent {
                        session_id: session_id.clone(),
                        exit_code,
                        signal,
                        reason: None,
                    });
                    return;
                }
                Ok(RuntimeEvent::Hint(state)) => {
                    let _ = events.state_tx.send(StateHintEvent {
                        session_id: session_id.clone(),
                        state,
                    });
                }
                Ok(RuntimeEvent::Output { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Bridge runtime events onto one subscriber's bounded stream. Broadcast
/// lag is the overflow signal: it emits a single
/// `desync(buffer_overflow)` and closes the stream.
async fn forward_subscriber_events(
    mut events: tokio::sync::broadcast::Receiver<RuntimeEvent>,
    tx: mpsc::Sender<PtyEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => return,
        };
        let out = match event {
            Ok(RuntimeEvent::Output { seq, bytes }) => PtyEvent::Output { bytes, seq },
            Ok(RuntimeEvent::Exit { exit_code, signal }) => {
                let _ = tx.send(PtyEvent::Exit { exit_code, signal }).await;
                return;
            }
            Ok(RuntimeEvent::Hint(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                let _ = tx
                    .send(PtyEvent::Desync {
                        reason: "buffer_overflow".to_string(),
                    })
                    .await;
                return;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        if tx.send(out).await.is_err() {
            return; // subscriber dropped the stream
        }
    }
}
