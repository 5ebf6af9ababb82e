//! Command dispatch for one gateway connection.
//!
//! Async-failure commands answer with their `*_result` event, echoing
//! the correlation keys of the request; idempotent toggles may stay
//! fire-and-forget. Store failures on these paths degrade to error
//! results — they never crash the daemon.

use attn_core::agents;
use attn_core::sessions::NewSession;
use attn_protocol::commands::ClientCommand;
use attn_protocol::events::DaemonEvent;
use attn_protocol::types::{AgentKind, SessionState, UserSettings};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ClientConn;
use crate::types::{PtyEvent, SpawnOptions};

impl ClientConn {
    pub(super) async fn dispatch(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::SpawnSession {
                id,
                cwd,
                agent,
                cols,
                rows,
                label,
                command,
            } => self.spawn_session(id, cwd, agent, cols, rows, label, command).await,
            ClientCommand::AttachSession {
                session_id,
                cols,
                rows,
            } => self.attach_session(session_id, cols, rows).await,
            ClientCommand::DetachSession { session_id } => self.detach_session(session_id).await,
            ClientCommand::PtyInput { session_id, data } => self.pty_input(session_id, data).await,
            ClientCommand::PtyResize {
                session_id,
                cols,
                rows,
            } => self.pty_resize(session_id, cols, rows).await,
            ClientCommand::KillSession { session_id, signal } => {
                self.kill_session(session_id, signal).await
            }
            ClientCommand::ClearSessions {} => self.clear_sessions().await,
            ClientCommand::UnregisterSession { session_id } => {
                self.unregister_session(session_id).await
            }
            ClientCommand::SetSessionLabel { session_id, label } => {
                self.set_session_label(session_id, label).await
            }
            ClientCommand::MutePr { id, muted } => self.mute_pr(id, muted).await,
            ClientCommand::MuteRepo { repo, muted } => self.mute_repo(repo, muted).await,
            ClientCommand::MuteAuthor { author, muted } => self.mute_author(author, muted).await,
            ClientCommand::MarkPrSeen { id } => self.mark_pr_seen(id).await,
            ClientCommand::UpdateSettings { settings } => self.update_settings(settings).await,
            ClientCommand::AddRecentLocation { path } => self.add_recent_location(path).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_session(
        &mut self,
        id: String,
        cwd: String,
        agent: String,
        cols: u16,
        rows: u16,
        label: Option<String>,
        command_override: Option<String>,
    ) {
        let Some(agent) = AgentKind::parse(&agent) else {
            self.send(DaemonEvent::SpawnResult {
                id,
                success: false,
                error: Some(format!("unknown agent kind: {agent}")),
            })
            .await;
            return;
        };

        let command = command_override.or_else(|| {
            agents::resolve_executable(agent, &self.state.config)
                .map(|p| p.display().to_string())
        });
        if command.is_none() && agent != AgentKind::Shell {
            self.send(DaemonEvent::SpawnResult {
                id,
                success: false,
                error: Some(format!("{agent} executable not found")),
            })
            .await;
            return;
        }

        let wrapper = std::env::var("ATTN_WRAPPER_PATH").ok();
        let opts = SpawnOptions {
            session_id: id.clone(),
            cwd: std::path::PathBuf::from(&cwd),
            agent,
            command,
            args: vec![],
            env: agents::spawn_env(&id, wrapper.as_deref()),
            cols,
            rows,
        };

        if let Err(e) = self.state.backend.spawn(opts).await {
            self.send(DaemonEvent::SpawnResult {
                id,
                success: false,
                error: Some(e.to_string()),
            })
            .await;
            return;
        }

        let registered = self.state.engine.register(NewSession {
            id: id.clone(),
            label,
            cwd: cwd.clone(),
            agent,
            state: SessionState::Launching,
            branch: None,
            worktree: None,
            agent_available: agents::is_available(agent, &self.state.config),
        });
        match registered {
            Ok(_) => {
                if let Err(e) = self.state.store.touch_recent_location(&cwd) {
                    debug!(event = "daemon.gateway.recent_location_failed", error = %e);
                }
                self.send(DaemonEvent::SpawnResult {
                    id,
                    success: true,
                    error: None,
                })
                .await;
            }
            Err(e) => {
                // Backend spawned but the engine refused; reap the orphan.
                let _ = self.state.backend.remove(&id).await;
                self.send(DaemonEvent::SpawnResult {
                    id,
                    success: false,
                    error: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    async fn attach_session(
        &mut self,
        session_id: String,
        cols: Option<u16>,
        rows: Option<u16>,
    ) {
        if let (Some(cols), Some(rows)) = (cols, rows)
            && let Err(e) = self.state.backend.resize(&session_id, cols, rows).await
        {
            debug!(
                event = "daemon.gateway.attach_resize_failed",
                session_id = %session_id,
                error = %e,
            );
        }

        match self.state.backend.attach(&session_id, &self.conn_id).await {
            Ok((info, mut events)) => {
                // Re-attach closes the previous forwarder for this conn.
                let cancel = CancellationToken::new();
                if let Some(previous) =
                    self.attachments.insert(session_id.clone(), cancel.clone())
                {
                    previous.cancel();
                }
                self.send(DaemonEvent::AttachResult {
                    session_id: session_id.clone(),
                    success: true,
                    error: None,
                    info: Some(info),
                })
                .await;

                let outbound = self.outbound.clone();
                let stream_session = session_id.clone();
                tokio::spawn(async move {
                    loop {
                        let event = tokio::select! {
                            event = events.recv() => event,
                            _ = cancel.cancelled() => return,
                        };
                        match event {
                            Some(PtyEvent::Output { bytes, seq }) => {
                                let wire = DaemonEvent::PtyOutput {
                                    session_id: stream_session.clone(),
                                    data: BASE64.encode(&bytes),
                                    seq,
                                };
                                if outbound.send(wire).await.is_err() {
                                    return;
                                }
                            }
                            Some(PtyEvent::Desync { reason }) => {
                                let _ = outbound
                                    .send(DaemonEvent::PtyDesync {
                                        session_id: stream_session.clone(),
                                        reason,
                                    })
                                    .await;
                                return;
                            }
                            // The daemon-wide exit handler broadcasts
                            // session_exited; the stream just ends.
                            Some(PtyEvent::Exit { .. }) | None => return,
                        }
                    }
                });
            }
            Err(e) => {
                self.send(DaemonEvent::AttachResult {
                    session_id,
                    success: false,
                    error: Some(e.to_string()),
                    info: None,
                })
                .await;
            }
        }
    }

    async fn detach_session(&mut self, session_id: String) {
        if let Some(token) = self.attachments.remove(&session_id) {
            token.cancel();
        }
        if let Err(e) = self.state.backend.detach(&session_id, &self.conn_id).await {
            debug!(
                event = "daemon.gateway.detach_failed",
                session_id = %session_id,
                error = %e,
            );
        }
    }

    async fn pty_input(&mut self, session_id: String, data: String) {
        let bytes = match BASE64.decode(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.send(DaemonEvent::CommandError {
                    cmd: "pty_input".to_string(),
                    code: "bad_request".to_string(),
                    message: format!("base64: {e}"),
                })
                .await;
                return;
            }
        };
        // The user acted: stale classifier verdicts must not land.
        self.state.engine.touch(&session_id);
        if let Err(e) = self.state.backend.input(&session_id, &bytes).await {
            self.send(DaemonEvent::CommandError {
                cmd: "pty_input".to_string(),
                code: e.error_code().to_string(),
                message: e.to_string(),
            })
            .await;
        }
    }

    async fn pty_resize(&mut self, session_id: String, cols: u16, rows: u16) {
        if let Err(e) = self.state.backend.resize(&session_id, cols, rows).await {
            self.send(DaemonEvent::CommandError {
                cmd: "pty_resize".to_string(),
                code: e.error_code().to_string(),
                message: e.to_string(),
            })
            .await;
        }
    }

    async fn kill_session(&mut self, session_id: String, signal: Option<String>) {
        match self
            .state
            .backend
            .kill(&session_id, signal.as_deref())
            .await
        {
            Ok(()) => {
                self.send(DaemonEvent::KillResult {
                    session_id,
                    success: true,
                    error: None,
                })
                .await;
            }
            Err(e) => {
                self.send(DaemonEvent::KillResult {
                    session_id,
                    success: false,
                    error: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    async fn clear_sessions(&mut self) {
        let mut removed = 0usize;
        for session_id in self.state.engine.session_ids() {
            if let Err(e) = self.state.backend.remove(&session_id).await {
                debug!(
                    event = "daemon.gateway.clear_backend_remove_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
            match self.state.engine.unregister(&session_id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    event = "daemon.gateway.clear_unregister_failed",
                    session_id = %session_id,
                    error = %e,
                ),
            }
        }
        self.send(DaemonEvent::ClearResult {
            success: true,
            removed,
            error: None,
        })
        .await;
    }

    async fn unregister_session(&mut self, session_id: String) {
        let _ = self.state.backend.remove(&session_id).await;
        if let Err(e) = self.state.engine.unregister(&session_id) {
            self.send(DaemonEvent::CommandError {
                cmd: "unregister_session".to_string(),
                code: e.error_code().to_string(),
                message: e.to_string(),
            })
            .await;
        }
    }

    async fn set_session_label(&mut self, session_id: String, label: String) {
        if let Err(e) = self.state.engine.set_label(&session_id, &label) {
            self.send(DaemonEvent::CommandError {
                cmd: "set_session_label".to_string(),
                code: e.error_code().to_string(),
                message: e.to_string(),
            })
            .await;
        }
    }

    async fn mute_pr(&mut self, id: String, muted: bool) {
        let result = self.state.store.set_pr_muted(&id, muted);
        self.pr_action_result("mute_pr", id, result).await;
    }

    async fn mute_repo(&mut self, repo: String, muted: bool) {
        let result = self.state.store.set_repo_muted(&repo, muted).map(|()| true);
        self.pr_action_result("mute_repo", repo, result).await;
    }

    async fn mute_author(&mut self, author: String, muted: bool) {
        let result = self
            .state
            .store
            .set_author_muted(&author, muted)
            .map(|()| true);
        self.pr_action_result("mute_author", author, result).await;
    }

    async fn mark_pr_seen(&mut self, id: String) {
        let result = self.state.store.mark_pr_seen(&id);
        self.pr_action_result("mark_pr_seen", id, result).await;
    }

    async fn pr_action_result(
        &mut self,
        cmd: &str,
        id: String,
        result: Result<bool, attn_store::StoreError>,
    ) {
        match result {
            Ok(found) => {
                self.send(DaemonEvent::PrActionResult {
                    id,
                    success: found,
                    error: (!found).then(|| "not found".to_string()),
                })
                .await;
                if let Ok(prs) = self.state.store.list_prs() {
                    let _ = self.state.daemon_events.send(DaemonEvent::PrsUpdated { prs });
                }
            }
            Err(e) => {
                warn!(
                    event = "daemon.gateway.pr_action_failed",
                    cmd = cmd,
                    error = %e,
                );
                self.send(DaemonEvent::PrActionResult {
                    id,
                    success: false,
                    error: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    async fn update_settings(&mut self, settings: UserSettings) {
        match self.state.store.set_settings(&settings) {
            Ok(()) => {
                let _ = self
                    .state
                    .daemon_events
                    .send(DaemonEvent::SettingsUpdated { settings });
            }
            Err(e) => {
                self.send(DaemonEvent::CommandError {
                    cmd: "update_settings".to_string(),
                    code: "store_degraded".to_string(),
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn add_recent_location(&mut self, path: String) {
        if let Err(e) = self.state.store.touch_recent_location(&path) {
            debug!(event = "daemon.gateway.recent_location_failed", error = %e);
            return;
        }
        if let Ok(locations) = self.state.store.list_recent_locations() {
            let _ = self
                .state
                .daemon_events
                .send(DaemonEvent::RecentLocationsUpdated { locations });
        }
    }
}
