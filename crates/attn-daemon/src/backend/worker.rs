//! Worker sidecar backend.
//!
//! Each session gets a `pty-worker` child process owning the PTY, spoken
//! to over JSONL RPC on a unix socket. The registry file is written
//! atomically before the session is considered ready, and the worker
//! outlives the daemon: the next daemon reconnects via `recover`.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attn_protocol::types::AttachInfo;
use attn_protocol::worker::{
    REGISTRY_VERSION, RegistryEntry, WorkerCall, WorkerEvent, WorkerSessionInfo, WorkerSpawnSpec,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendContext, PtyBackend, monitor, recovery};
use crate::errors::DaemonError;
use crate::pid::is_process_alive;
use crate::registry;
use crate::rpc::WorkerRpc;
use crate::types::{PtyEvent, RecoveryReport, SpawnOptions};

/// Readiness probing after spawn: attempts and initial backoff.
const READINESS_ATTEMPTS: u32 = 12;
const READINESS_BACKOFF_MS: u64 = 100;

/// Grace between SIGTERM and SIGKILL when reclaiming a spawn orphan.
const ORPHAN_TERM_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct WorkerSessionHandle {
    pub entry: RegistryEntry,
    pub entry_path: PathBuf,
    pub monitors: CancellationToken,
    /// Pooled control connection; rebuilt on transient failure.
    control: AsyncMutex<Option<WorkerRpc>>,
    /// Daemon-side forwarder cancel tokens by subscriber id.
    subscribers: std::sync::Mutex<HashMap<String, CancellationToken>>,
}

pub struct WorkerBackend {
    pub(crate) ctx: BackendContext,
    pub(crate) sessions: RwLock<HashMap<String, Arc<WorkerSessionHandle>>>,
}

impl WorkerBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.rpc_default_timeout_ms)
    }

    fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.rpc_liveness_timeout_ms)
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<WorkerSessionHandle>, DaemonError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))
    }

    /// Run one RPC on the pooled control connection, reconnecting once
    /// when the cached connection went stale.
    async fn control_call(
        &self,
        handle: &WorkerSessionHandle,
        call: WorkerCall,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError> {
        let mut slot = handle.control.lock().await;
        for attempt in 0..2 {
            if slot.is_none() {
                let mut rpc = WorkerRpc::connect(&handle.entry.socket_path, timeout).await?;
                rpc.hello(
                    &handle.entry.daemon_instance_id,
                    &handle.entry.control_token,
                    timeout,
                )
                .await?;
                *slot = Some(rpc);
            }
            let Some(rpc) = slot.as_mut() else {
                continue;
            };
            match rpc.call(call.clone(), timeout).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt == 0 => {
                    debug!(
                        event = "daemon.backend.control_conn_reset",
                        session_id = %handle.entry.session_id,
                        error = %e,
                    );
                    *slot = None;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DaemonError::RpcTransient("control call retries exhausted".to_string()))
    }

    /// Insert a session handle and start its monitors. Shared by the
    /// spawn path and recovery.
    pub(crate) async fn register_session(
        &self,
        entry: RegistryEntry,
        entry_path: PathBuf,
    ) -> Arc<WorkerSessionHandle> {
        let monitors = monitor::start_monitors(
            entry.clone(),
            self.ctx.config.clone(),
            self.ctx.events.clone(),
        );
        let handle = Arc::new(WorkerSessionHandle {
            entry,
            entry_path,
            monitors,
            control: AsyncMutex::new(None),
            subscribers: std::sync::Mutex::new(HashMap::new()),
        });
        self.sessions
            .write()
            .await
            .insert(handle.entry.session_id.clone(), handle.clone());
        handle
    }

    pub(crate) async fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    fn worker_binary(&self) -> PathBuf {
        if let Ok(wrapper) = std::env::var("ATTN_WRAPPER_PATH") {
            return PathBuf::from(wrapper);
        }
        std::env::current_exe().unwrap_or_else(|_| PathBuf::from("attn"))
    }

    fn capture_path(&self, session_id: &str) -> Option<PathBuf> {
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

    /// SIGTERM, wait, SIGKILL a worker that never became ready, then
    /// reclaim its registry file and socket.
    fn cleanup_spawn_orphan(
        &self,
        child: &mut std::process::Child,
        entry: &RegistryEntry,
        entry_path: &std::path::Path,
    ) {
        warn!(
            event = "daemon.backend.spawn_orphan_cleanup",
            session_id = %entry.session_id,
            worker_pid = entry.worker_pid,
        );
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        let deadline = std::time::Instant::now() + ORPHAN_TERM_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => {
                    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = child.wait();
                    break;
                }
                Err(_) => break,
            }
        }
        let _ = registry::prune_entry(&self.ctx.paths, entry_path, entry);
    }
}

#[async_trait]
impl PtyBackend for WorkerBackend {
    async fn spawn(&self, opts: SpawnOptions) -> Result<(), DaemonError> {
        if !attn_paths::is_valid_session_id(&opts.session_id) {
            return Err(DaemonError::BadRequest(format!(
                "invalid session id: {}",
                opts.session_id
            )));
        }
        if self.is_registered(&opts.session_id).await {
            return Err(DaemonError::SessionAlreadyExists(opts.session_id));
        }
        let socket_path = self
            .ctx
            .paths
            .worker_socket_path(&self.ctx.instance_id, &opts.session_id)?;
        let control_token = uuid::Uuid::new_v4().to_string();

        let spec = WorkerSpawnSpec {
            version: 1,
            session_id: opts.session_id.clone(),
            socket_path: socket_path.clone(),
            daemon_instance_id: self.ctx.instance_id.clone(),
            control_token: control_token.clone(),
            cwd: opts.cwd.clone(),
            command: opts.command.clone(),
            args: opts.args.clone(),
            env: opts.env.clone(),
            cols: opts.cols,
            rows: opts.rows,
            scrollback_bytes: self.ctx.config.scrollback_bytes,
            agent: opts.agent.as_str().to_string(),
            capture_path: self.capture_path(&opts.session_id),
        };

        // Worker stdout/stderr are captured per session.
        let log_path = self
            .ctx
            .paths
            .worker_log_file(&self.ctx.instance_id, &opts.session_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log_file.try_clone()?;

        let mut command = std::process::Command::new(self.worker_binary());
        command
            .arg("pty-worker")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_err));
        // Own process group: the worker must not die with the daemon.
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| DaemonError::WorkerSpawn(format!("spawn pty-worker: {e}")))?;

        // The spawn spec travels over stdin, not argv.
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| DaemonError::WorkerSpawn("worker stdin unavailable".to_string()))?;
            let line = serde_json::to_string(&spec)?;
            stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"))
                .map_err(|e| DaemonError::WorkerSpawn(format!("write spawn spec: {e}")))?;
        }

        let entry = RegistryEntry {
            version: REGISTRY_VERSION,
            session_id: opts.session_id.clone(),
            socket_path,
            worker_pid: child.id(),
            control_token,
            daemon_instance_id: self.ctx.instance_id.clone(),
            owner_pid: self.ctx.lease.pid,
            owner_started_at: self.ctx.lease.started_at,
            owner_nonce: self.ctx.lease.nonce.clone(),
        };
        // Recorded before the session is marked ready: recovery must be
        // able to find the worker even if we crash mid-spawn.
        let entry_path = registry::write_entry(&self.ctx.paths, &self.ctx.instance_id, &entry)?;

        // Readiness probe with backoff.
        let mut backoff = Duration::from_millis(READINESS_BACKOFF_MS);
        let mut ready = false;
        for attempt in 0..READINESS_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 3 / 2).min(Duration::from_secs(1));
            match probe_worker(&entry, self.liveness_timeout()).await {
                Ok(_) => {
                    ready = true;
                    break;
                }
                Err(e) => {
                    debug!(
                        event = "daemon.backend.readiness_probe_failed",
                        session_id = %entry.session_id,
                        attempt = attempt,
                        error = %e,
                    );
                }
            }
        }
        if !ready {
            self.cleanup_spawn_orphan(&mut child, &entry, &entry_path);
            return Err(DaemonError::WorkerSpawn(format!(
                "worker for {} never became ready",
                entry.session_id
            )));
        }

        // Reap the worker when it eventually exits so it cannot zombie.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        self.register_session(entry, entry_path).await;
        info!(
            event = "daemon.backend.worker_spawned",
            session_id = %opts.session_id,
        );
        Ok(())
    }

    async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachInfo, mpsc::Receiver<PtyEvent>), DaemonError> {
        let handle = self.handle(session_id).await?;

        // Close the previous stream for this subscriber, if any.
        let cancel = CancellationToken::new();
        let previous = handle
            .subscribers
            .lock()
            .ok()
            .and_then(|mut subs| subs.insert(subscriber_id.to_string(), cancel.clone()));
        if let Some(previous) = previous {
            previous.cancel();
        }

        let mut rpc = WorkerRpc::connect(&handle.entry.socket_path, self.default_timeout()).await?;
        rpc.hello(
            &handle.entry.daemon_instance_id,
            &handle.entry.control_token,
            self.default_timeout(),
        )
        .await?;
        let info: AttachInfo = rpc
            .call_typed(
                WorkerCall::Attach {
                    subscriber_id: subscriber_id.to_string(),
                },
                self.default_timeout(),
            )
            .await?;

        // From here the connection is a stream with no read deadline.
        let mut stream = rpc.into_event_stream();
        let (tx, rx) = mpsc::channel(self.ctx.config.subscriber_buffer_messages);
        let stream_session = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = stream.next_event() => event,
                    _ = cancel.cancelled() => return,
                };
                let out = match event {
                    Ok(Some(WorkerEvent::Output { data, seq })) => match BASE64.decode(&data) {
                        Ok(bytes) => PtyEvent::Output { bytes, seq },
                        Err(e) => {
                            warn!(
                                event = "daemon.backend.attach_decode_failed",
                                session_id = %stream_session,
                                error = %e,
                            );
                            PtyEvent::Desync {
                                reason: "decode_error".to_string(),
                            }
                        }
                    },
                    Ok(Some(WorkerEvent::Desync { reason })) => {
                        let _ = tx.send(PtyEvent::Desync { reason }).await;
                        return;
                    }
                    Ok(Some(WorkerEvent::Exit { exit_code, signal })) => {
                        let _ = tx.send(PtyEvent::Exit { exit_code, signal }).await;
                        return;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return,
                };
                if tx.send(out).await.is_err() {
                    return;
                }
            }
        });

        Ok((info, rx))
    }

    async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), DaemonError> {
        let handle = self.handle(session_id).await?;
        if let Some(token) = handle
            .subscribers
            .lock()
            .ok()
            .and_then(|mut subs| subs.remove(subscriber_id))
        {
            token.cancel();
        }
        // Best-effort: the worker drops the stream when its end closes.
        let _ = self
            .control_call(
                &handle,
                WorkerCall::Detach {
                    subscriber_id: subscriber_id.to_string(),
                },
                self.liveness_timeout(),
            )
            .await;
        Ok(())
    }

    async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), DaemonError> {
        let handle = self.handle(session_id).await?;
        self.control_call(
            &handle,
            WorkerCall::Input {
                data: BASE64.encode(bytes),
            },
            self.default_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), DaemonError> {
        let handle = self.handle(session_id).await?;
        self.control_call(
            &handle,
            WorkerCall::Resize { cols, rows },
            self.default_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn kill(&self, session_id: &str, signal: Option<&str>) -> Result<(), DaemonError> {
        let handle = self.handle(session_id).await?;
        let name = signal.unwrap_or("SIGKILL").to_string();
        self.control_call(&handle, WorkerCall::Signal { name }, self.default_timeout())
            .await?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), DaemonError> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?
        };
        handle.monitors.cancel();
        if let Ok(subs) = handle.subscribers.lock() {
            for token in subs.values() {
                token.cancel();
            }
        }
        // Ask the worker to exit; a dead worker is pruned regardless.
        if let Err(e) = self
            .control_call(
                &handle,
                WorkerCall::Remove {
                    control_token: handle.entry.control_token.clone(),
                },
                Duration::from_millis(self.ctx.config.rpc_reclaim_timeout_ms),
            )
            .await
        {
            warn!(
                event = "daemon.backend.remove_rpc_failed",
                session_id = session_id,
                error = %e,
            );
        }
        registry::prune_entry(&self.ctx.paths, &handle.entry_path, &handle.entry)?;
        info!(event = "daemon.backend.worker_removed", session_id = session_id);
        Ok(())
    }

    async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn session_info(&self, session_id: &str) -> Result<WorkerSessionInfo, DaemonError> {
        let handle = self.handle(session_id).await?;
        let value = self
            .control_call(&handle, WorkerCall::Info, self.liveness_timeout())
            .await?;
        serde_json::from_value(value)
            .map_err(|e| DaemonError::RpcFatal(format!("malformed info: {e}")))
    }

    async fn session_likely_alive(&self, session_id: &str) -> bool {
        let Ok(handle) = self.handle(session_id).await else {
            return false;
        };
        if is_process_alive(handle.entry.worker_pid) {
            return true;
        }
        // PID re-use is possible; a connectable socket settles it.
        WorkerRpc::connect(&handle.entry.socket_path, self.liveness_timeout())
            .await
            .is_ok()
    }

    async fn recover(&self) -> RecoveryReport {
        recovery::recover_worker_backend(self).await
    }

    async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (session_id, handle) in sessions.drain() {
            handle.monitors.cancel();
            if let Ok(subs) = handle.subscribers.lock() {
                for token in subs.values() {
                    token.cancel();
                }
            }
            debug!(
                event = "daemon.backend.worker_detached_on_shutdown",
                session_id = %session_id,
            );
        }
        // Workers keep running; the next daemon recovers them.
    }
}

/// Connect + hello + info against a registry entry. Used by readiness
/// probing and recovery.
pub(crate) async fn probe_worker(
    entry: &RegistryEntry,
    timeout: Duration,
) -> Result<WorkerSessionInfo, DaemonError> {
    let mut rpc = WorkerRpc::connect(&entry.socket_path, timeout).await?;
    let hello = rpc
        .hello(&entry.daemon_instance_id, &entry.control_token, timeout)
        .await?;
    if hello.session_id != entry.session_id {
        return Err(DaemonError::RpcFatal(format!(
            "worker session id {} does not match registry entry {}",
            hello.session_id, entry.session_id
        )));
    }
    rpc.info(timeout).await
}
