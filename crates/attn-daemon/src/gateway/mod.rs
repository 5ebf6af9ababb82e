//! WebSocket client gateway.
//!
//! Accepts UI clients on `ws://127.0.0.1:<port>/ws`. Each connection has
//! a single inbound pipeline (strict FIFO command processing) and a
//! bounded outbound queue; slow clients are evicted rather than allowed
//! to stall the daemon. `initial_state` is deferred until the recovery
//! barrier lifts.

mod commands;

use std::collections::HashMap;
use std::sync::Arc;

use attn_core::config::DaemonConfig;
use attn_core::sessions::{EngineEvent, SessionEngine};
use attn_protocol::commands::ClientCommand;
use attn_protocol::events::DaemonEvent;
use attn_store::Store;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::PtyBackend;
use crate::barrier::RecoveryGate;
use crate::errors::DaemonError;

/// Consecutive failed sends (socket errors or queue overflow) before a
/// client is disconnected.
const SLOW_CLIENT_STRIKES: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub backend: Arc<dyn PtyBackend>,
    pub store: Arc<Store>,
    pub config: Arc<DaemonConfig>,
    pub gate: RecoveryGate,
    pub instance_id: String,
    pub warnings: Vec<String>,
    /// Daemon-wide events not derived from the session engine
    /// (exits, PR updates, settings changes, degraded-store banners).
    pub daemon_events: broadcast::Sender<DaemonEvent>,
}

/// Serve the gateway until cancelled.
pub async fn run_gateway(state: AppState, cancel: CancellationToken) -> Result<(), DaemonError> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "daemon.gateway.listening", addr = %addr);

    let router = axum::Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(event = "daemon.gateway.client_connected", conn_id = %conn_id);

    let (ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, outbound_rx) =
        mpsc::channel::<DaemonEvent>(state.config.subscriber_buffer_messages);

    // Slow-client eviction signal, shared by the writer, the event
    // forwarder, and the read loop. Several tasks hold clones of the
    // outbound sender, so a sender drop can never close the channel —
    // eviction must cancel this token and break the read loop so both
    // socket halves drop and the connection actually closes.
    let conn_cancel = CancellationToken::new();

    let writer = tokio::spawn(writer_task(
        ws_sink,
        outbound_rx,
        conn_id.clone(),
        conn_cancel.clone(),
    ));

    // `initial_state` waits for the recovery barrier; commands that
    // arrive earlier are answered (or refused) by the inbound loop.
    let forwarder = {
        let state = state.clone();
        let outbound = outbound_tx.clone();
        let conn_id = conn_id.clone();
        let cancel = conn_cancel.clone();
        tokio::spawn(async move {
            state.gate.lifted().await;
            // Subscribe before snapshotting so no update is lost between
            // the snapshot and the live stream.
            let engine_rx = state.engine.subscribe();
            let daemon_rx = state.daemon_events.subscribe();
            let initial = assemble_initial_state(&state);
            if outbound.send(initial).await.is_err() {
                return;
            }
            forward_events(engine_rx, daemon_rx, outbound, conn_id, cancel).await;
        })
    };

    let mut conn = ClientConn {
        conn_id: conn_id.clone(),
        state,
        outbound: outbound_tx,
        attachments: HashMap::new(),
    };

    // Strict FIFO: each command is fully dispatched before the next
    // frame is read.
    loop {
        let message = tokio::select! {
            message = ws_stream.next() => message,
            _ = conn_cancel.cancelled() => {
                warn!(
                    event = "daemon.gateway.slow_client_evicted",
                    conn_id = %conn.conn_id,
                );
                break;
            }
        };
        let Some(message) = message else { break };
        match message {
            Ok(Message::Text(text)) => conn.handle_raw_command(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong ignored
            Err(e) => {
                debug!(
                    event = "daemon.gateway.client_read_failed",
                    conn_id = %conn.conn_id,
                    error = %e,
                );
                break;
            }
        }
    }

    conn.teardown().await;
    conn_cancel.cancel();
    forwarder.abort();
    writer.abort();
    // Both socket halves are dropped here (the read half with this
    // frame, the write half with the aborted writer), closing the
    // connection even when the client never sends Close.
    info!(event = "daemon.gateway.client_disconnected", conn_id = %conn_id);
}

/// Drain the outbound queue onto the socket. Three consecutive send
/// failures cancel the connection token, which breaks the read loop and
/// closes the socket — returning alone would only drop the write half
/// while the read loop keeps the connection open.
///
/// Generic over the sink so eviction is testable without a peer.
async fn writer_task<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<DaemonEvent>,
    conn_id: String,
    cancel: CancellationToken,
) where
    S: futures::Sink<Message> + Unpin,
{
    let mut consecutive_failures: u32 = 0;
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = event else { break };
        let payload = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(event = "daemon.gateway.serialize_failed", error = %e);
                continue;
            }
        };
        if sink.send(Message::Text(payload.into())).await.is_err() {
            consecutive_failures += 1;
            if consecutive_failures >= SLOW_CLIENT_STRIKES {
                warn!(
                    event = "daemon.gateway.slow_client_disconnected",
                    conn_id = %conn_id,
                );
                cancel.cancel();
                break;
            }
        } else {
            consecutive_failures = 0;
        }
    }
    let _ = sink.close().await;
}

/// Bridge engine and daemon broadcasts into one client's outbound queue.
/// Queue overflow counts as a failed send; three in a row evict the
/// client by cancelling the connection token.
async fn forward_events(
    mut engine_rx: broadcast::Receiver<EngineEvent>,
    mut daemon_rx: broadcast::Receiver<DaemonEvent>,
    outbound: mpsc::Sender<DaemonEvent>,
    conn_id: String,
    cancel: CancellationToken,
) {
    let mut consecutive_full: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            engine_event = engine_rx.recv() => match engine_event {
                Ok(event) => Some(engine_event_to_wire(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event = "daemon.gateway.engine_events_lagged",
                        conn_id = %conn_id,
                        skipped = skipped,
                    );
                    None
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            daemon_event = daemon_rx.recv() => match daemon_event {
                Ok(event) => Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event = "daemon.gateway.daemon_events_lagged",
                        conn_id = %conn_id,
                        skipped = skipped,
                    );
                    None
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        let Some(event) = event else { continue };
        match outbound.try_send(event) {
            Ok(()) => consecutive_full = 0,
            Err(mpsc::error::TrySendError::Full(_)) => {
                consecutive_full += 1;
                if consecutive_full >= SLOW_CLIENT_STRIKES {
                    warn!(
                        event = "daemon.gateway.outbound_overflow_disconnect",
                        conn_id = %conn_id,
                    );
                    // Other tasks hold clones of this sender, so the
                    // channel cannot be closed from here; the token
                    // breaks the read loop and tears the socket down.
                    cancel.cancel();
                    return;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

fn engine_event_to_wire(event: EngineEvent) -> DaemonEvent {
    match event {
        EngineEvent::Registered(session) | EngineEvent::Updated(session) => {
            DaemonEvent::SessionRegistered { session }
        }
        EngineEvent::StateChanged {
            session_id,
            state,
            state_since,
            state_updated_at,
        } => DaemonEvent::SessionStateChanged {
            session_id,
            state,
            state_since,
            state_updated_at,
        },
        EngineEvent::TodosUpdated { session_id, todos } => {
            DaemonEvent::SessionTodosUpdated { session_id, todos }
        }
        EngineEvent::Unregistered { session_id } => {
            DaemonEvent::SessionUnregistered { session_id }
        }
    }
}

fn assemble_initial_state(state: &AppState) -> DaemonEvent {
    let prs = state.store.list_prs().unwrap_or_default();
    let repo_mutes = state.store.list_repo_mutes().unwrap_or_default();
    let author_mutes = state.store.list_author_mutes().unwrap_or_default();
    let settings = state.store.get_settings().unwrap_or_default();
    let recent_locations = state.store.list_recent_locations().unwrap_or_default();
    DaemonEvent::InitialState {
        protocol_version: state.config.protocol_version.clone(),
        daemon_instance_id: state.instance_id.clone(),
        sessions: state.engine.list(),
        prs,
        repo_mutes,
        author_mutes,
        settings,
        recent_locations,
        warnings: state.warnings.clone(),
    }
}

/// Per-connection command context.
struct ClientConn {
    conn_id: String,
    state: AppState,
    outbound: mpsc::Sender<DaemonEvent>,
    /// Attached sessions by id, with the cancel token of their stream
    /// forwarder.
    attachments: HashMap<String, CancellationToken>,
}

impl ClientConn {
    #[cfg(test)]
    fn new_for_test(state: AppState, outbound: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            conn_id: "test-conn".to_string(),
            state,
            outbound,
            attachments: HashMap::new(),
        }
    }

    async fn send(&self, event: DaemonEvent) {
        let _ = self.outbound.send(event).await;
    }

    async fn handle_raw_command(&mut self, raw: &str) {
        let command: ClientCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(e) => {
                // Echo the offending cmd name when it can be extracted.
                let cmd = serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("cmd").and_then(|c| c.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                self.send(DaemonEvent::CommandError {
                    cmd,
                    code: "bad_request".to_string(),
                    message: format!("malformed command: {e}"),
                })
                .await;
                return;
            }
        };

        if !self.state.gate.is_lifted() && command.gated_by_recovery() {
            self.send(DaemonEvent::CommandError {
                cmd: command.name().to_string(),
                code: "daemon_recovering".to_string(),
                message: "recovery in progress; retry after initial_state".to_string(),
            })
            .await;
            return;
        }

        if !command.log_exempt() {
            info!(
                event = "daemon.gateway.command_received",
                conn_id = %self.conn_id,
                cmd = command.name(),
            );
        }

        self.dispatch(command).await;
    }

    async fn teardown(&mut self) {
        for (session_id, token) in self.attachments.drain() {
            token.cancel();
            if let Err(e) = self.state.backend.detach(&session_id, &self.conn_id).await {
                debug!(
                    event = "daemon.gateway.teardown_detach_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendContext, EmbeddedBackend};
    use crate::barrier::recovery_gate;
    use crate::identity::OwnershipLease;
    use crate::types::BackendEvents;
    use attn_protocol::PROTOCOL_VERSION;

    fn test_state(lifted: bool) -> (AppState, crate::barrier::RecoveryGateHandle) {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let config = Arc::new(DaemonConfig::default());
        let dir = std::env::temp_dir().join(format!("attn-gw-test-{}", uuid::Uuid::new_v4()));
        let backend = Arc::new(EmbeddedBackend::new(BackendContext {
            paths: attn_paths::AttnPaths::from_dir(dir),
            instance_id: "d-gw".to_string(),
            lease: OwnershipLease::generate(),
            config: config.clone(),
            events: BackendEvents { exit_tx, state_tx },
        }));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Arc::new(SessionEngine::new(store.clone()));
        let (handle, gate) = recovery_gate();
        if lifted {
            handle.lift();
        }
        let (daemon_events, _) = broadcast::channel(64);
        (
            AppState {
                engine,
                backend,
                store,
                config,
                gate,
                instance_id: "d-gw".to_string(),
                warnings: vec![],
                daemon_events,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn test_pty_commands_refused_during_recovery() {
        let (state, _handle) = test_state(false);
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = ClientConn::new_for_test(state, tx);

        // Spec wire example: a spawn before initial_state.
        conn.handle_raw_command(
            r#"{"cmd":"spawn_session","id":"s1","cwd":"/tmp","agent":"shell","cols":80,"rows":24}"#,
        )
        .await;
        match rx.recv().await.unwrap() {
            DaemonEvent::CommandError { cmd, code, .. } => {
                assert_eq!(cmd, "spawn_session");
                assert_eq!(code, "daemon_recovering");
            }
            other => panic!("expected command_error, got {other:?}"),
        }

        // pty_input is refused too, never silently dropped.
        conn.handle_raw_command(r#"{"cmd":"pty_input","session_id":"s1","data":"aGkK"}"#)
            .await;
        match rx.recv().await.unwrap() {
            DaemonEvent::CommandError { cmd, code, .. } => {
                assert_eq!(cmd, "pty_input");
                assert_eq!(code, "daemon_recovering");
            }
            other => panic!("expected command_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_pty_commands_pass_during_recovery() {
        let (state, _handle) = test_state(false);
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = ClientConn::new_for_test(state, tx);

        conn.handle_raw_command(r#"{"cmd":"mark_pr_seen","id":"o/r#1"}"#).await;
        match rx.recv().await.unwrap() {
            DaemonEvent::PrActionResult { id, success, .. } => {
                assert_eq!(id, "o/r#1");
                assert!(!success); // no such PR, but not gated
            }
            other => panic!("expected pr_action_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_command_echoes_cmd() {
        let (state, _handle) = test_state(true);
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = ClientConn::new_for_test(state, tx);

        conn.handle_raw_command(r#"{"cmd":"warp_core_eject","id":"x"}"#).await;
        match rx.recv().await.unwrap() {
            DaemonEvent::CommandError { cmd, code, .. } => {
                assert_eq!(cmd, "warp_core_eject");
                assert_eq!(code, "bad_request");
            }
            other => panic!("expected command_error, got {other:?}"),
        }

        conn.handle_raw_command("not json at all").await;
        match rx.recv().await.unwrap() {
            DaemonEvent::CommandError { cmd, .. } => assert_eq!(cmd, "unknown"),
            other => panic!("expected command_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_input_after_lift() {
        let (state, _handle) = test_state(true);
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = ClientConn::new_for_test(state, tx);

        conn.handle_raw_command(r#"{"cmd":"pty_input","session_id":"ghost","data":"aGkK"}"#)
            .await;
        match rx.recv().await.unwrap() {
            DaemonEvent::CommandError { cmd, code, .. } => {
                assert_eq!(cmd, "pty_input");
                assert_eq!(code, "session_not_found");
            }
            other => panic!("expected command_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initial_state_assembly() {
        let (state, _handle) = test_state(true);
        let initial = assemble_initial_state(&state);
        match initial {
            DaemonEvent::InitialState {
                protocol_version,
                daemon_instance_id,
                sessions,
                warnings,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_instance_id, "d-gw");
                assert!(sessions.is_empty());
                assert!(warnings.is_empty());
            }
            other => panic!("expected initial_state, got {other:?}"),
        }
    }

    /// Sink that fails every send, standing in for a wedged client
    /// socket.
    struct FailingSink;

    impl futures::Sink<Message> for FailingSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        }

        fn start_send(
            self: std::pin::Pin<&mut Self>,
            _item: Message,
        ) -> Result<(), Self::Error> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            ))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    /// Sink that accepts everything, for clean-shutdown paths.
    struct NullSink;

    impl futures::Sink<Message> for NullSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(
            self: std::pin::Pin<&mut Self>,
            _item: Message,
        ) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn probe_event(n: usize) -> DaemonEvent {
        DaemonEvent::SessionUnregistered {
            session_id: format!("s{n}"),
        }
    }

    #[tokio::test]
    async fn test_writer_sink_failures_cancel_connection() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(writer_task(
            FailingSink,
            rx,
            "test-conn".to_string(),
            cancel.clone(),
        ));

        // Three consecutive failed sends must evict the client: the
        // token cancels even though `tx` (and any clones) stay alive.
        for n in 0..3 {
            tx.send(probe_event(n)).await.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(2), cancel.cancelled())
            .await
            .expect("writer should cancel the connection after 3 strikes");
        tokio::time::timeout(std::time::Duration::from_secs(2), writer)
            .await
            .expect("writer task should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_clean_close_does_not_evict() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(writer_task(
            NullSink,
            rx,
            "test-conn".to_string(),
            cancel.clone(),
        ));

        tx.send(probe_event(0)).await.unwrap();
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(2), writer)
            .await
            .expect("writer should exit when the queue closes")
            .unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_forwarder_overflow_cancels_connection() {
        let (engine_tx, engine_rx) = broadcast::channel::<EngineEvent>(64);
        let (daemon_tx, daemon_rx) = broadcast::channel::<DaemonEvent>(64);
        // Queue depth 1 with nobody draining: the first event fills it,
        // the next three overflow.
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            engine_rx,
            daemon_rx,
            outbound_tx,
            "test-conn".to_string(),
            cancel.clone(),
        ));

        for n in 0..4 {
            engine_tx
                .send(EngineEvent::Unregistered {
                    session_id: format!("s{n}"),
                })
                .unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(2), cancel.cancelled())
            .await
            .expect("forwarder should cancel the connection after 3 overflows");
        tokio::time::timeout(std::time::Duration::from_secs(2), forwarder)
            .await
            .expect("forwarder task should finish")
            .unwrap();
        drop(daemon_tx);
    }
}
