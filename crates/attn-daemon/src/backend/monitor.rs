//! Per-session monitors for worker sidecars.
//!
//! Two tasks per live session. The lifecycle watcher holds a long-lived
//! `watch` stream and forwards exit and state-hint events; when the
//! worker predates `watch` or the stream misbehaves it degrades to
//! polling `info`. The health poller probes every few seconds and
//! synthesizes a `worker_unreachable` exit only once the session has
//! been unreachable past the timeout *and* is provably not alive —
//! ambiguity always defers, never demotes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use attn_core::config::DaemonConfig;
use attn_protocol::worker::{RegistryEntry, WorkerCall, WorkerEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::pid::is_process_alive;
use crate::rpc::WorkerRpc;
use crate::types::{BackendEvents, ExitEvent, StateHintEvent};

/// Consecutive health failures before a session counts as unreachable.
const UNREACHABLE_STRIKES: u32 = 3;

/// A watch stream erroring this many times in quick succession is
/// treated as broken and the watcher degrades to polling.
const TIGHT_LOOP_ERRORS: u32 = 20;
const TIGHT_LOOP_WINDOW: Duration = Duration::from_millis(50);

/// Poll cadence in degraded (no `watch` support) mode.
const LEGACY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before a failed watch stream is re-established.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub fn start_monitors(
    entry: RegistryEntry,
    config: Arc<DaemonConfig>,
    events: BackendEvents,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn(lifecycle_watcher(
        entry.clone(),
        config.clone(),
        events.clone(),
        cancel.clone(),
    ));
    tokio::spawn(health_poller(entry, config, events, cancel.clone()));
    cancel
}

async fn open_watch_stream(
    entry: &RegistryEntry,
    timeout: Duration,
) -> Result<crate::rpc::WorkerEventStream, DaemonError> {
    let mut rpc = WorkerRpc::connect(&entry.socket_path, timeout).await?;
    rpc.hello(&entry.daemon_instance_id, &entry.control_token, timeout)
        .await?;
    rpc.call(WorkerCall::Watch, timeout).await?;
    Ok(rpc.into_event_stream())
}

fn is_unknown_method(err: &DaemonError) -> bool {
    matches!(err, DaemonError::RpcFatal(msg) if msg.contains("unknown method"))
}

async fn lifecycle_watcher(
    entry: RegistryEntry,
    config: Arc<DaemonConfig>,
    events: BackendEvents,
    cancel: CancellationToken,
) {
    let timeout = Duration::from_millis(config.rpc_default_timeout_ms);
    let session_id = entry.session_id.clone();
    let mut quick_errors: u32 = 0;
    let mut last_error_at: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let stream = tokio::select! {
            stream = open_watch_stream(&entry, timeout) => stream,
            _ = cancel.cancelled() => return,
        };
        let mut stream = match stream {
            Ok(stream) => {
                quick_errors = 0;
                stream
            }
            Err(e) if is_unknown_method(&e) => {
                info!(
                    event = "daemon.monitor.watch_unsupported",
                    session_id = %session_id,
                );
                legacy_poll_loop(&entry, &events, &cancel, timeout).await;
                return;
            }
            Err(e) => {
                debug!(
                    event = "daemon.monitor.watch_open_failed",
                    session_id = %session_id,
                    error = %e,
                );
                tokio::select! {
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
        };

        loop {
            let event = tokio::select! {
                event = stream.next_event() => event,
                _ = cancel.cancelled() => return,
            };
            match event {
                Ok(Some(WorkerEvent::StateHint { state })) => {
                    let _ = events.state_tx.send(StateHintEvent {
                        session_id: session_id.clone(),
                        state,
                    });
                }
                Ok(Some(WorkerEvent::StateChanged { running })) => {
                    debug!(
                        event = "daemon.monitor.state_changed",
                        session_id = %session_id,
                        running = running,
                    );
                }
                Ok(Some(WorkerEvent::Exit { exit_code, signal })) => {
                    let _ = events.exit_tx.send(ExitEvent {
                        session_id: session_id.clone(),
                        exit_code,
                        signal,
                        reason: None,
                    });
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    // Orderly close; reconnect after a beat.
                    break;
                }
                Err(e) => {
                    // A stream failing instantly over and over means the
                    // transport is wedged, not slow.
                    let now = Instant::now();
                    if last_error_at.is_some_and(|t| now.duration_since(t) < TIGHT_LOOP_WINDOW) {
                        quick_errors += 1;
                    } else {
                        quick_errors = 1;
                    }
                    last_error_at = Some(now);
                    if quick_errors >= TIGHT_LOOP_ERRORS {
                        warn!(
                            event = "daemon.monitor.watch_tight_loop",
                            session_id = %session_id,
                            errors = quick_errors,
                        );
                        legacy_poll_loop(&entry, &events, &cancel, timeout).await;
                        return;
                    }
                    debug!(
                        event = "daemon.monitor.watch_read_failed",
                        session_id = %session_id,
                        error = %e,
                    );
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// Poll `info` when `watch` is unavailable. Synthesizes an exit when the
/// child stops running.
async fn legacy_poll_loop(
    entry: &RegistryEntry,
    events: &BackendEvents,
    cancel: &CancellationToken,
    timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(LEGACY_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
        let probe = async {
            let mut rpc = WorkerRpc::connect(&entry.socket_path, timeout).await?;
            rpc.hello(&entry.daemon_instance_id, &entry.control_token, timeout)
                .await?;
            rpc.info(timeout).await
        };
        match probe.await {
            Ok(info) if !info.running => {
                let _ = events.exit_tx.send(ExitEvent {
                    session_id: entry.session_id.clone(),
                    exit_code: info.exit_code,
                    signal: info.exit_signal,
                    reason: None,
                });
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(
                    event = "daemon.monitor.legacy_poll_failed",
                    session_id = %entry.session_id,
                    error = %e,
                );
                // The health poller owns unreachable handling.
            }
        }
    }
}

async fn health_poller(
    entry: RegistryEntry,
    config: Arc<DaemonConfig>,
    events: BackendEvents,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(config.health_poll_interval_seconds);
    let liveness_timeout = Duration::from_millis(config.rpc_liveness_timeout_ms);
    let unreachable_timeout = Duration::from_secs(config.worker_unreachable_timeout_seconds);
    let session_id = entry.session_id.clone();

    let mut consecutive_failures: u32 = 0;
    let mut unreachable_since: Option<Instant> = None;
    // Workers that predate `health` answer `info` instead.
    let mut legacy_health = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        let call = if legacy_health {
            WorkerCall::Info
        } else {
            WorkerCall::Health
        };
        let probe = async {
            let mut rpc = WorkerRpc::connect(&entry.socket_path, liveness_timeout).await?;
            rpc.hello(
                &entry.daemon_instance_id,
                &entry.control_token,
                liveness_timeout,
            )
            .await?;
            rpc.call(call, liveness_timeout).await
        };
        match probe.await {
            Ok(_) => {
                if unreachable_since.is_some() {
                    info!(
                        event = "daemon.monitor.reachable_again",
                        session_id = %session_id,
                    );
                }
                consecutive_failures = 0;
                unreachable_since = None;
            }
            Err(e) if is_unknown_method(&e) && !legacy_health => {
                legacy_health = true;
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(
                    event = "daemon.monitor.health_failed",
                    session_id = %session_id,
                    consecutive = consecutive_failures,
                    error = %e,
                );
                if consecutive_failures >= UNREACHABLE_STRIKES && unreachable_since.is_none() {
                    warn!(
                        event = "daemon.monitor.unreachable_marked",
                        session_id = %session_id,
                    );
                    unreachable_since = Some(Instant::now());
                }
                if let Some(since) = unreachable_since
                    && since.elapsed() >= unreachable_timeout
                {
                    if proven_not_alive(&entry, liveness_timeout).await {
                        warn!(
                            event = "daemon.monitor.unreachable_exit_synthesized",
                            session_id = %session_id,
                        );
                        let _ = events.exit_tx.send(ExitEvent {
                            session_id: session_id.clone(),
                            exit_code: None,
                            signal: None,
                            reason: Some("worker_unreachable".to_string()),
                        });
                        return;
                    }
                    // Liveness ambiguous: defer, never demote.
                    debug!(
                        event = "daemon.monitor.unreachable_but_ambiguous",
                        session_id = %session_id,
                    );
                }
            }
        }
    }
}

/// Registry/PID/socket probe: only a worker that is dead by every signal
/// is treated as gone.
async fn proven_not_alive(entry: &RegistryEntry, timeout: Duration) -> bool {
    if is_process_alive(entry.worker_pid) {
        return false;
    }
    if WorkerRpc::connect(&entry.socket_path, timeout).await.is_ok() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_detection() {
        assert!(is_unknown_method(&DaemonError::RpcFatal(
            "bad_request: unknown method: watch".to_string()
        )));
        assert!(!is_unknown_method(&DaemonError::RpcFatal(
            "bad_request: control token mismatch".to_string()
        )));
        assert!(!is_unknown_method(&DaemonError::RpcTransient(
            "dial timeout".to_string()
        )));
    }

    #[tokio::test]
    async fn test_proven_not_alive_requires_dead_pid_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let entry = RegistryEntry {
            version: 1,
            session_id: "s1".to_string(),
            socket_path: dir.path().join("none.sock"),
            worker_pid: std::process::id(), // alive
            control_token: "tok".to_string(),
            daemon_instance_id: "d".to_string(),
            owner_pid: 1,
            owner_started_at: chrono::Utc::now(),
            owner_nonce: "n".to_string(),
        };
        assert!(!proven_not_alive(&entry, Duration::from_millis(100)).await);

        let dead = RegistryEntry {
            worker_pid: 4_294_967,
            ..entry
        };
        assert!(proven_not_alive(&dead, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_monitors_stop_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let entry = RegistryEntry {
            version: 1,
            session_id: "s1".to_string(),
            socket_path: dir.path().join("none.sock"),
            worker_pid: 4_294_967,
            control_token: "tok".to_string(),
            daemon_instance_id: "d".to_string(),
            owner_pid: 1,
            owner_started_at: chrono::Utc::now(),
            owner_nonce: "n".to_string(),
        };
        let (exit_tx, _exit_rx) = tokio::sync::mpsc::unbounded_channel();
        let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
        let config = Arc::new(DaemonConfig::default());
        let cancel = start_monitors(entry, config, BackendEvents { exit_tx, state_tx });
        cancel.cancel();
        // Cancellation must not hang; give the tasks a beat to observe it.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
