//! Daemon server: the startup orchestrator and long-running event loops.
//!
//! Startup sequence: PID lock (refusing to displace a live peer) →
//! identity + ownership lease → store (degraded fallback) → backend
//! selection → raise the recovery barrier → bounded recovery scan and
//! store reconciliation → lift the barrier → serve. Shutdown stops
//! monitors and releases the lock; worker sidecars keep running.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use attn_core::classifier::{ClassifierPipeline, TriggerSource};
use attn_core::config::DaemonConfig;
use attn_core::sessions::{EngineEvent, Session, SessionEngine};
use attn_core::transcripts::TranscriptWatcher;
use attn_core::{notify, transcripts};
use attn_paths::AttnPaths;
use attn_protocol::events::DaemonEvent;
use attn_protocol::types::SessionState;
use attn_store::Store;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendContext, PtyBackend, build_backend};
use crate::barrier::recovery_gate;
use crate::control::{ControlState, WatchRequest, run_control_socket};
use crate::errors::DaemonError;
use crate::gateway::{AppState, run_gateway};
use crate::identity::{OwnershipLease, load_or_create_instance_id};
use crate::pid;
use crate::types::{BackendEvents, ExitEvent, RecoveryReport, StateHintEvent};

/// Grace period of transcript silence before the quiet-window trigger.
const QUIET_WINDOW: Duration = Duration::from_secs(2);

/// Cadence of the background deferred-reconcile task.
const DEFERRED_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// How long a `working`/`launching` session without a runtime must sit
/// untouched before the background reconciler demotes it to idle.
const STALE_DEMOTION_AGE: chrono::Duration = chrono::Duration::seconds(60);

/// Run the daemon until a shutdown signal.
pub async fn run_server(paths: AttnPaths, config: DaemonConfig) -> Result<(), DaemonError> {
    // 1. Single-instance lock; a live peer is never displaced.
    let pid_path = paths.daemon_pid_file();
    pid::acquire_pid_lock(&pid_path)?;

    let result = run_server_locked(&paths, config).await;

    if let Err(e) = pid::remove_pid_file(&pid_path) {
        error!(event = "daemon.server.pid_cleanup_failed", error = %e);
    }
    result
}

async fn run_server_locked(paths: &AttnPaths, config: DaemonConfig) -> Result<(), DaemonError> {
    let config = Arc::new(config);

    // 2. Identity assigned once; lease fresh per process.
    let instance_id = load_or_create_instance_id(paths)?;
    let lease = OwnershipLease::generate();
    info!(
        event = "daemon.server.identity_loaded",
        instance_id = %instance_id,
        owner_pid = lease.pid,
    );

    // 3. Store, falling back to in-memory on failure.
    let store = Arc::new(Store::open(&paths.store_db())?);
    let mut warnings = Vec::new();
    let degraded = store.degraded().is_some();
    if let Some(info) = store.degraded() {
        warnings.push(format!(
            "storage degraded: {} ({})",
            info.db_path, info.hint
        ));
    }

    // 4. Backend selection (worker default, embedded opt-in).
    let (exit_tx, exit_rx) = mpsc::unbounded_channel::<ExitEvent>();
    let (state_tx, state_rx) = mpsc::unbounded_channel::<StateHintEvent>();
    let backend = build_backend(
        config.pty_backend,
        BackendContext {
            paths: paths.clone(),
            instance_id: instance_id.clone(),
            lease,
            config: config.clone(),
            events: BackendEvents { exit_tx, state_tx },
        },
    );
    info!(
        event = "daemon.server.backend_selected",
        backend = ?config.pty_backend,
    );

    let engine = Arc::new(SessionEngine::new(store.clone()));
    let classifier = Arc::new(ClassifierPipeline::new(engine.clone(), config.clone()));
    let (daemon_events, _) = broadcast::channel::<DaemonEvent>(1024);

    // 5. Recovery barrier up before anything client-visible.
    let (gate_handle, gate) = recovery_gate();
    let cancel = CancellationToken::new();

    // Signal handler.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal(cancel).await {
                error!(
                    event = "daemon.server.signal_handler_failed",
                    error = %e,
                    "SIGTERM/SIGINT will not trigger graceful shutdown.",
                );
            }
        });
    }

    // Control socket and gateway accept immediately; the barrier defers
    // initial_state and refuses PTY-lifecycle commands.
    let (watch_tx, watch_rx) = mpsc::unbounded_channel::<WatchRequest>();
    let control_state = ControlState {
        engine: engine.clone(),
        classifier: classifier.clone(),
        gate: gate.clone(),
        instance_id: instance_id.clone(),
        started_at: std::time::Instant::now(),
        degraded,
        watch_tx,
    };
    {
        let socket_path = config.socket_path(paths);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_control_socket(socket_path, control_state, cancel).await {
                error!(event = "daemon.server.control_socket_failed", error = %e);
            }
        });
    }
    {
        let app_state = AppState {
            engine: engine.clone(),
            backend: backend.clone(),
            store: store.clone(),
            config: config.clone(),
            gate: gate.clone(),
            instance_id: instance_id.clone(),
            warnings: warnings.clone(),
            daemon_events: daemon_events.clone(),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_gateway(app_state, cancel.clone()).await {
                error!(event = "daemon.server.gateway_failed", error = %e);
                cancel.cancel();
            }
        });
    }

    // Backend lifecycle loops.
    tokio::spawn(exit_event_loop(
        exit_rx,
        engine.clone(),
        backend.clone(),
        daemon_events.clone(),
    ));
    tokio::spawn(state_hint_loop(state_rx, engine.clone()));
    tokio::spawn(watcher_manager(
        watch_rx,
        engine.clone(),
        classifier.clone(),
        cancel.clone(),
    ));
    tokio::spawn(notifier_loop(engine.clone(), store.clone(), cancel.clone()));

    // 6. Recovery scan under a bounded timeout, then reconcile with the
    // store.
    let recovery_began = Utc::now();
    let report = match tokio::time::timeout(
        Duration::from_secs(config.recovery_timeout_seconds),
        backend.recover(),
    )
    .await
    {
        Ok(report) => report,
        Err(_) => {
            warn!(
                event = "daemon.server.recovery_timed_out",
                timeout_secs = config.recovery_timeout_seconds,
            );
            RecoveryReport::default()
        }
    };
    reconcile_with_store(&engine, &store, backend.as_ref(), &report, recovery_began).await;

    // 7. Lift the barrier; clients now get initial_state.
    gate_handle.lift();
    info!(
        event = "daemon.server.recovery_barrier_lifted",
        recovered = report.recovered.len(),
        deferred = report.deferred.len(),
    );

    // 8. Background deferred reconciliation keeps converging stragglers.
    tokio::spawn(deferred_reconcile_loop(
        backend.clone(),
        engine.clone(),
        store.clone(),
        cancel.clone(),
    ));

    cancel.cancelled().await;
    info!(event = "daemon.server.shutdown_started");

    // Monitors stop, workers keep running for the next daemon.
    backend.shutdown().await;
    info!(event = "daemon.server.shutdown_completed");
    Ok(())
}

async fn wait_for_shutdown_signal(cancel: CancellationToken) -> Result<(), DaemonError> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!(event = "daemon.server.sigterm_received"),
        _ = sigint.recv() => info!(event = "daemon.server.sigint_received"),
        _ = cancel.cancelled() => return Ok(()),
    }
    cancel.cancel();
    Ok(())
}

/// Merge recovered runtime sessions with persisted session metadata.
///
/// Preserves `waiting_input`/`pending_approval`; demotes missing-running
/// sessions to idle; skips demotion for sessions updated after recovery
/// began or whose worker is still liveness-positive; defers anything
/// ambiguous to the background reconciler.
async fn reconcile_with_store(
    engine: &SessionEngine,
    store: &Store,
    backend: &dyn PtyBackend,
    report: &RecoveryReport,
    recovery_began: chrono::DateTime<Utc>,
) {
    let stored = store.load_sessions().unwrap_or_else(|e| {
        warn!(event = "daemon.server.reconcile_load_failed", error = %e);
        Vec::new()
    });
    let recovered: HashSet<&str> = report.recovered.iter().map(String::as_str).collect();
    let deferred: HashSet<&str> = report.deferred.iter().map(String::as_str).collect();
    let mut seen_in_store: HashSet<String> = HashSet::new();

    for snapshot in &stored {
        seen_in_store.insert(snapshot.id.to_string());
        let mut session = Session::from_snapshot(snapshot);

        let has_runtime = recovered.contains(&*snapshot.id);
        let is_deferred = deferred.contains(&*snapshot.id);
        if !has_runtime && !is_deferred {
            let fresh = snapshot.state_updated_at > recovery_began;
            let alive = backend.session_likely_alive(&snapshot.id).await;
            let demotable = matches!(
                snapshot.state,
                SessionState::Working | SessionState::Launching | SessionState::Unknown
            );
            if demotable && !fresh && !alive {
                let now = Utc::now();
                info!(
                    event = "daemon.server.reconcile_demoted_to_idle",
                    session_id = %snapshot.id,
                    previous = %snapshot.state,
                );
                session.state = SessionState::Idle;
                session.state_since = now;
                session.state_updated_at = now;
            }
            // waiting_input / pending_approval are preserved as-is.
        }
        engine.adopt(session);
    }

    // Runtime sessions with no store row (store lost or degraded):
    // create them so the client sees every recoverable session.
    for session_id in &report.recovered {
        if seen_in_store.contains(session_id) {
            continue;
        }
        let now = Utc::now();
        info!(
            event = "daemon.server.reconcile_adopted_runtime_only",
            session_id = %session_id,
        );
        engine.adopt(Session {
            id: session_id.clone(),
            label: session_id.clone(),
            cwd: String::new(),
            agent: attn_protocol::types::AgentKind::Shell,
            state: SessionState::Idle,
            state_since: now,
            state_updated_at: now,
            todos: vec![],
            branch: None,
            worktree: None,
            resume_session_id: None,
            agent_available: true,
            created_at: now,
            launched_at: now,
        });
    }
}

/// Session exits (real or synthesized) broadcast to clients, then the
/// session is retired from backend and engine.
async fn exit_event_loop(
    mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    engine: Arc<SessionEngine>,
    backend: Arc<dyn PtyBackend>,
    daemon_events: broadcast::Sender<DaemonEvent>,
) {
    while let Some(event) = exit_rx.recv().await {
        info!(
            event = "daemon.server.session_exited",
            session_id = %event.session_id,
            exit_code = ?event.exit_code,
            reason = ?event.reason,
        );
        let _ = daemon_events.send(DaemonEvent::SessionExited {
            session_id: event.session_id.clone(),
            exit_code: event.exit_code,
            signal: event.signal.clone(),
            reason: event.reason.clone(),
        });
        if let Err(e) = backend.remove(&event.session_id).await
            && !matches!(e, DaemonError::SessionNotFound(_))
        {
            debug!(
                event = "daemon.server.exit_backend_remove_failed",
                session_id = %event.session_id,
                error = %e,
            );
        }
        if let Err(e) = engine.unregister(&event.session_id)
            && !matches!(e, attn_core::SessionError::NotFound(_))
        {
            warn!(
                event = "daemon.server.exit_unregister_failed",
                session_id = %event.session_id,
                error = %e,
            );
        }
    }
}

/// Heuristic hints from PTY output funnel through the engine's
/// admission rules.
async fn state_hint_loop(
    mut state_rx: mpsc::UnboundedReceiver<StateHintEvent>,
    engine: Arc<SessionEngine>,
) {
    while let Some(hint) = state_rx.recv().await {
        engine.apply_heuristic(&hint.session_id, hint.state);
    }
}

/// Owns per-session transcript watchers: created on demand (hook stop
/// events or discovery), torn down on unregister. Quiet-window events
/// trigger the classifier's second, hook-independent path.
async fn watcher_manager(
    mut watch_rx: mpsc::UnboundedReceiver<WatchRequest>,
    engine: Arc<SessionEngine>,
    classifier: Arc<ClassifierPipeline>,
    cancel: CancellationToken,
) {
    let mut watchers: HashMap<String, TranscriptWatcher> = HashMap::new();
    let (quiet_tx, mut quiet_rx) = mpsc::unbounded_channel();
    let mut engine_events = engine.subscribe();

    loop {
        tokio::select! {
            request = watch_rx.recv() => {
                let Some(request) = request else { return };
                if watchers.contains_key(&request.session_id) {
                    continue;
                }
                let path = request.transcript_path.clone().or_else(|| {
                    let session = engine.get(&request.session_id)?;
                    let home = dirs::home_dir()?;
                    transcripts::locate_transcript(&home, &session)
                });
                let Some(path) = path else {
                    debug!(
                        event = "daemon.server.watcher_no_transcript",
                        session_id = %request.session_id,
                    );
                    continue;
                };
                info!(
                    event = "daemon.server.transcript_watcher_started",
                    session_id = %request.session_id,
                    path = %path.display(),
                );
                watchers.insert(
                    request.session_id.clone(),
                    TranscriptWatcher::spawn(
                        request.session_id,
                        path,
                        QUIET_WINDOW,
                        quiet_tx.clone(),
                    ),
                );
            }
            quiet = quiet_rx.recv() => {
                let Some(quiet) = quiet else { return };
                let classifier = classifier.clone();
                tokio::spawn(async move {
                    classifier
                        .classify_end_of_turn(
                            &quiet.session_id,
                            None,
                            Some(&quiet.transcript_path),
                            quiet.quiet_at,
                            TriggerSource::QuietWindow,
                        )
                        .await;
                });
            }
            engine_event = engine_events.recv() => {
                match engine_event {
                    Ok(EngineEvent::Unregistered { session_id }) => {
                        if watchers.remove(&session_id).is_some() {
                            debug!(
                                event = "daemon.server.transcript_watcher_stopped",
                                session_id = %session_id,
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Emit notification intents when a session newly needs the user.
async fn notifier_loop(
    engine: Arc<SessionEngine>,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    let mut events = engine.subscribe();
    let mut last_states: HashMap<String, SessionState> = HashMap::new();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => return,
        };
        match event {
            Ok(EngineEvent::StateChanged {
                session_id, state, ..
            }) => {
                let old = last_states
                    .insert(session_id.clone(), state)
                    .unwrap_or(SessionState::Launching);
                let enabled = store
                    .get_settings()
                    .map(|s| s.notifications_enabled)
                    .unwrap_or(true);
                if notify::should_notify(enabled, old, state)
                    && let Some(session) = engine.get(&session_id)
                {
                    notify::emit_notification_intent(session.agent, &session.label, state);
                }
            }
            Ok(EngineEvent::Unregistered { session_id }) => {
                last_states.remove(&session_id);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Background convergence after the barrier lifts: retries deferred
/// registry entries and demotes long-stale sessions whose runtime is
/// provably gone.
async fn deferred_reconcile_loop(
    backend: Arc<dyn PtyBackend>,
    engine: Arc<SessionEngine>,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DEFERRED_RECONCILE_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }

        let report = backend.recover().await;
        if !report.recovered.is_empty() {
            info!(
                event = "daemon.server.deferred_recovered",
                count = report.recovered.len(),
            );
            let stored = store.load_sessions().unwrap_or_default();
            for session_id in &report.recovered {
                if engine.get(session_id).is_some() {
                    continue;
                }
                if let Some(snapshot) = stored.iter().find(|s| &*s.id == session_id.as_str()) {
                    engine.adopt(Session::from_snapshot(snapshot));
                }
            }
        }

        // Converge sessions stuck mid-flight with no runtime behind them.
        let runtime_ids: HashSet<String> = backend.session_ids().await.into_iter().collect();
        for snapshot in engine.list() {
            let stale = Utc::now() - snapshot.state_updated_at > STALE_DEMOTION_AGE;
            let demotable = matches!(
                snapshot.state,
                SessionState::Working | SessionState::Launching
            );
            if demotable
                && stale
                && !runtime_ids.contains(&*snapshot.id)
                && !backend.session_likely_alive(&snapshot.id).await
            {
                info!(
                    event = "daemon.server.deferred_demoted_to_idle",
                    session_id = %snapshot.id,
                );
                engine.update_state_if_newer(&snapshot.id, SessionState::Idle, Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attn_protocol::types::{AgentKind, SessionSnapshot};
    use attn_protocol::worker::WorkerSessionInfo;
    use async_trait::async_trait;
    use attn_protocol::types::AttachInfo;
    use crate::types::{PtyEvent, SpawnOptions};

    /// Backend double with scripted liveness answers.
    struct FakeBackend {
        alive: HashSet<String>,
        runtime: Vec<String>,
    }

    #[async_trait]
    impl PtyBackend for FakeBackend {
        async fn spawn(&self, _opts: SpawnOptions) -> Result<(), DaemonError> {
            Ok(())
        }
        async fn attach(
            &self,
            session_id: &str,
            _subscriber_id: &str,
        ) -> Result<(AttachInfo, mpsc::Receiver<PtyEvent>), DaemonError> {
            Err(DaemonError::SessionNotFound(session_id.to_string()))
        }
        async fn detach(&self, _s: &str, _sub: &str) -> Result<(), DaemonError> {
            Ok(())
        }
        async fn input(&self, s: &str, _b: &[u8]) -> Result<(), DaemonError> {
            Err(DaemonError::SessionNotFound(s.to_string()))
        }
        async fn resize(&self, _s: &str, _c: u16, _r: u16) -> Result<(), DaemonError> {
            Ok(())
        }
        async fn kill(&self, _s: &str, _sig: Option<&str>) -> Result<(), DaemonError> {
            Ok(())
        }
        async fn remove(&self, _s: &str) -> Result<(), DaemonError> {
            Ok(())
        }
        async fn session_ids(&self) -> Vec<String> {
            self.runtime.clone()
        }
        async fn session_info(&self, s: &str) -> Result<WorkerSessionInfo, DaemonError> {
            Err(DaemonError::SessionNotFound(s.to_string()))
        }
        async fn session_likely_alive(&self, session_id: &str) -> bool {
            self.alive.contains(session_id)
        }
        async fn recover(&self) -> RecoveryReport {
            RecoveryReport::default()
        }
        async fn shutdown(&self) {}
    }

    fn stored_snapshot(id: &str, state: SessionState) -> SessionSnapshot {
        let past = Utc::now() - chrono::Duration::minutes(10);
        SessionSnapshot {
            id: id.into(),
            label: id.to_string(),
            cwd: "/tmp".to_string(),
            agent: AgentKind::Claude,
            state,
            state_since: past,
            state_updated_at: past,
            todos: vec![],
            branch: None,
            worktree: None,
            resume_session_id: None,
            agent_available: false,
            created_at: past,
        }
    }

    #[tokio::test]
    async fn test_reconcile_preserves_waiting_and_pending() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_session(&stored_snapshot("s-wait", SessionState::WaitingInput)).unwrap();
        store.upsert_session(&stored_snapshot("s-appr", SessionState::PendingApproval)).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec![],
        };

        reconcile_with_store(
            &engine,
            &store,
            &backend,
            &RecoveryReport::default(),
            Utc::now(),
        )
        .await;

        assert_eq!(
            engine.get("s-wait").unwrap().state,
            SessionState::WaitingInput
        );
        assert_eq!(
            engine.get("s-appr").unwrap().state,
            SessionState::PendingApproval
        );
    }

    #[tokio::test]
    async fn test_reconcile_demotes_missing_running_to_idle() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_session(&stored_snapshot("s-work", SessionState::Working)).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec![],
        };

        reconcile_with_store(
            &engine,
            &store,
            &backend,
            &RecoveryReport::default(),
            Utc::now(),
        )
        .await;

        assert_eq!(engine.get("s-work").unwrap().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_skips_demotion_for_liveness_positive() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_session(&stored_snapshot("s-live", SessionState::Working)).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::from(["s-live".to_string()]),
            runtime: vec![],
        };

        reconcile_with_store(
            &engine,
            &store,
            &backend,
            &RecoveryReport::default(),
            Utc::now(),
        )
        .await;

        assert_eq!(engine.get("s-live").unwrap().state, SessionState::Working);
    }

    #[tokio::test]
    async fn test_reconcile_skips_demotion_for_fresh_updates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut snap = stored_snapshot("s-fresh", SessionState::Working);
        snap.state_updated_at = Utc::now() + chrono::Duration::seconds(5);
        store.upsert_session(&snap).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec![],
        };

        // Recovery "began" before the session's last update.
        reconcile_with_store(&engine, &store, &backend, &RecoveryReport::default(), Utc::now())
            .await;

        assert_eq!(engine.get("s-fresh").unwrap().state, SessionState::Working);
    }

    #[tokio::test]
    async fn test_reconcile_preserves_recovered_state() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_session(&stored_snapshot("s-rec", SessionState::Working)).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec!["s-rec".to_string()],
        };
        let report = RecoveryReport {
            recovered: vec!["s-rec".to_string()],
            ..RecoveryReport::default()
        };

        reconcile_with_store(&engine, &store, &backend, &report, Utc::now()).await;
        assert_eq!(engine.get("s-rec").unwrap().state, SessionState::Working);
    }

    #[tokio::test]
    async fn test_reconcile_creates_runtime_only_sessions_once() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec!["s-ghost".to_string()],
        };
        let report = RecoveryReport {
            recovered: vec!["s-ghost".to_string()],
            ..RecoveryReport::default()
        };

        reconcile_with_store(&engine, &store, &backend, &report, Utc::now()).await;
        let sessions = engine.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(&*sessions[0].id, "s-ghost");
        assert_eq!(sessions[0].state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_defers_ambiguous_sessions() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_session(&stored_snapshot("s-defer", SessionState::Working)).unwrap();
        let engine = SessionEngine::new(store.clone());
        let backend = FakeBackend {
            alive: HashSet::new(),
            runtime: vec![],
        };
        let report = RecoveryReport {
            deferred: vec!["s-defer".to_string()],
            ..RecoveryReport::default()
        };

        reconcile_with_store(&engine, &store, &backend, &report, Utc::now()).await;
        // Deferred sessions keep their stored state until the background
        // reconciler settles them.
        assert_eq!(engine.get("s-defer").unwrap().state, SessionState::Working);
    }
}
