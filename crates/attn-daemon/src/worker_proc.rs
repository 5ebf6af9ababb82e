//! The pty-worker process.
//!
//! One worker owns one PTY and its scrollback/screen state, serving
//! JSONL RPC on a unix socket. Workers are spawned by the daemon but do
//! not die with it — a restarted daemon reconnects through the registry.
//! The process exits only on an authenticated `remove` (or a fatal bind
//! error at startup).

use std::io::BufRead;
use std::sync::{Arc, Mutex};

use attn_protocol::codec::{read_message, write_message};
use attn_protocol::types::AgentKind;
use attn_protocol::worker::{
    HelloResult, RPC_MAJOR, RPC_MINOR, WorkerCall, WorkerEvent, WorkerFrame, WorkerRequest,
    WorkerResponse, WorkerSpawnSpec, error_codes,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::DaemonError;
use crate::runtime::{PtySessionRuntime, RuntimeEvent};
use crate::types::SpawnOptions;

/// Entry point for `attn pty-worker`: reads one `WorkerSpawnSpec` JSON
/// line from stdin, then serves until removed.
pub fn run_worker_from_stdin() -> Result<(), DaemonError> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let spec: WorkerSpawnSpec = serde_json::from_str(line.trim())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_worker(spec))
}

struct WorkerState {
    spec: WorkerSpawnSpec,
    runtime: PtySessionRuntime,
    /// Active attach streams by subscriber id; re-attach cancels the
    /// previous stream first.
    subscribers: Mutex<std::collections::HashMap<String, CancellationToken>>,
}

pub async fn run_worker(spec: WorkerSpawnSpec) -> Result<(), DaemonError> {
    let socket_path = spec.socket_path.clone();
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    let agent = AgentKind::parse(&spec.agent).unwrap_or(AgentKind::Shell);
    let opts = SpawnOptions {
        session_id: spec.session_id.clone(),
        cwd: spec.cwd.clone(),
        agent,
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: spec.env.clone(),
        cols: spec.cols,
        rows: spec.rows,
    };
    let runtime = PtySessionRuntime::spawn(
        &opts,
        spec.scrollback_bytes,
        256,
        spec.capture_path.clone(),
    )?;

    info!(
        event = "worker.started",
        session_id = %spec.session_id,
        socket = %socket_path.display(),
        pid = std::process::id(),
    );

    let state = Arc::new(WorkerState {
        spec,
        runtime,
        subscribers: Mutex::new(std::collections::HashMap::new()),
    });
    let shutdown = CancellationToken::new();

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_connection(stream, state, shutdown));
                    }
                    Err(e) => {
                        error!(event = "worker.accept_failed", error = %e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!(event = "worker.shutdown_started", session_id = %state.spec.session_id);
                break;
            }
        }
    }

    // Removed: tear down the child and our socket.
    if state.runtime.is_running() {
        let _ = state.runtime.kill(None);
    }
    if let Err(e) = std::fs::remove_file(&socket_path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(event = "worker.socket_cleanup_failed", error = %e);
    }
    info!(event = "worker.shutdown_completed");
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<WorkerState>,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut helloed = false;

    // No per-RPC read deadline: daemon control connections idle between
    // calls and stream connections idle between output bursts.
    loop {
        let frame: Option<WorkerFrame> = match read_message(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(event = "worker.conn_read_failed", error = %e);
                return;
            }
        };
        let req = match frame {
            Some(WorkerFrame::Req(req)) => req,
            Some(_) => {
                debug!(event = "worker.conn_unexpected_frame");
                continue;
            }
            None => return, // peer closed
        };
        let WorkerRequest { id, call } = req;

        if !helloed && !matches!(call, WorkerCall::Hello(_)) {
            let res = WorkerResponse::err(id, error_codes::BAD_REQUEST, "hello required");
            if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                return;
            }
            continue;
        }

        match call {
            WorkerCall::Hello(params) => {
                let res = if params.rpc_major != RPC_MAJOR {
                    WorkerResponse::err(
                        id,
                        error_codes::UNSUPPORTED_VERSION,
                        format!("rpc major {} != {RPC_MAJOR}", params.rpc_major),
                    )
                } else if params.rpc_min_minor > RPC_MINOR {
                    WorkerResponse::err(
                        id,
                        error_codes::UNSUPPORTED_VERSION,
                        format!("rpc minor {} required, have {RPC_MINOR}", params.rpc_min_minor),
                    )
                } else if params.daemon_instance_id != state.spec.daemon_instance_id {
                    WorkerResponse::err(
                        id,
                        error_codes::BAD_REQUEST,
                        "daemon_instance_id mismatch",
                    )
                } else if params.control_token != state.spec.control_token {
                    WorkerResponse::err(id, error_codes::BAD_REQUEST, "control token mismatch")
                } else {
                    helloed = true;
                    WorkerResponse::ok(
                        id,
                        serde_json::to_value(HelloResult {
                            daemon_instance_id: state.spec.daemon_instance_id.clone(),
                            session_id: state.spec.session_id.clone(),
                            rpc_major: RPC_MAJOR,
                            rpc_minor: RPC_MINOR,
                        })
                        .unwrap_or(serde_json::Value::Null),
                    )
                };
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Info | WorkerCall::Health => {
                let info = state.runtime.info();
                let res = WorkerResponse::ok(
                    id,
                    serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
                );
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Input { data } => {
                let res = match BASE64.decode(&data) {
                    Ok(bytes) => match state.runtime.input(&bytes) {
                        Ok(()) => WorkerResponse::ok(id, serde_json::Value::Null),
                        Err(e) => WorkerResponse::err(
                            id,
                            error_codes::SESSION_NOT_RUNNING,
                            e.to_string(),
                        ),
                    },
                    Err(e) => {
                        WorkerResponse::err(id, error_codes::BAD_REQUEST, format!("base64: {e}"))
                    }
                };
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Resize { cols, rows } => {
                let res = match state.runtime.resize(cols, rows) {
                    Ok(()) => WorkerResponse::ok(id, serde_json::Value::Null),
                    Err(e) => {
                        WorkerResponse::err(id, error_codes::SESSION_NOT_RUNNING, e.to_string())
                    }
                };
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Signal { name } => {
                let res = match state.runtime.kill(Some(&name)) {
                    Ok(()) => WorkerResponse::ok(id, serde_json::Value::Null),
                    Err(DaemonError::BadRequest(msg)) => {
                        WorkerResponse::err(id, error_codes::BAD_REQUEST, msg)
                    }
                    Err(e) => {
                        WorkerResponse::err(id, error_codes::SESSION_NOT_RUNNING, e.to_string())
                    }
                };
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Detach { subscriber_id } => {
                let cancelled = state
                    .subscribers
                    .lock()
                    .ok()
                    .and_then(|mut subs| subs.remove(&subscriber_id));
                if let Some(token) = cancelled {
                    token.cancel();
                }
                let res = WorkerResponse::ok(id, serde_json::Value::Null);
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
            }

            WorkerCall::Remove { control_token } => {
                if control_token != state.spec.control_token {
                    let res =
                        WorkerResponse::err(id, error_codes::BAD_REQUEST, "control token mismatch");
                    if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                        return;
                    }
                    continue;
                }
                let res = WorkerResponse::ok(id, serde_json::Value::Null);
                let _ = write_message(&mut write_half, &WorkerFrame::Res(res)).await;
                shutdown.cancel();
                return;
            }

            WorkerCall::Attach { subscriber_id } => {
                // Idempotent re-attach: close the previous stream first.
                let cancel = CancellationToken::new();
                let previous = state.subscribers.lock().ok().and_then(|mut subs| {
                    subs.insert(subscriber_id.clone(), cancel.clone())
                });
                if let Some(previous) = previous {
                    previous.cancel();
                }

                let (info, rx) = state.runtime.attach_snapshot();
                let res = WorkerResponse::ok(
                    id,
                    serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
                );
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
                debug!(
                    event = "worker.subscriber_attached",
                    subscriber_id = %subscriber_id,
                );
                stream_attach_events(&mut write_half, rx, &cancel).await;
                if let Ok(mut subs) = state.subscribers.lock()
                    && subs.get(&subscriber_id).is_some_and(|t| t.is_cancelled())
                {
                    subs.remove(&subscriber_id);
                }
                return;
            }

            WorkerCall::Watch => {
                let rx = state.runtime.subscribe();
                let res = WorkerResponse::ok(id, serde_json::Value::Null);
                if write_message(&mut write_half, &WorkerFrame::Res(res)).await.is_err() {
                    return;
                }
                stream_watch_events(&mut write_half, rx, &shutdown).await;
                return;
            }
        }
    }
}

/// Forward output/exit events to an attach stream until the subscriber
/// detaches, the connection drops, or the subscriber lags. Lag emits a
/// single `desync(buffer_overflow)` and closes the stream.
async fn stream_attach_events(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    mut rx: tokio::sync::broadcast::Receiver<RuntimeEvent>,
    cancel: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = cancel.cancelled() => return,
        };
        let frame = match event {
            Ok(RuntimeEvent::Output { seq, bytes }) => WorkerFrame::Evt(WorkerEvent::Output {
                data: BASE64.encode(&bytes),
                seq,
            }),
            Ok(RuntimeEvent::Exit { exit_code, signal }) => {
                let _ = write_message(
                    write_half,
                    &WorkerFrame::Evt(WorkerEvent::Exit { exit_code, signal }),
                )
                .await;
                return;
            }
            Ok(RuntimeEvent::Hint(_)) => continue, // watch streams carry hints
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "worker.subscriber_lagged", skipped = skipped);
                let _ = write_message(
                    write_half,
                    &WorkerFrame::Evt(WorkerEvent::Desync {
                        reason: "buffer_overflow".to_string(),
                    }),
                )
                .await;
                return;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        if write_message(write_half, &frame).await.is_err() {
            return;
        }
    }
}

/// Forward lifecycle events (state hints, exit) to a watch stream.
async fn stream_watch_events(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    mut rx: tokio::sync::broadcast::Receiver<RuntimeEvent>,
    shutdown: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.cancelled() => return,
        };
        match event {
            Ok(RuntimeEvent::Hint(state)) => {
                if write_message(
                    write_half,
                    &WorkerFrame::Evt(WorkerEvent::StateHint { state }),
                )
                .await
                .is_err()
                {
                    return;
                }
            }
            Ok(RuntimeEvent::Exit { exit_code, signal }) => {
                let _ = write_message(
                    write_half,
                    &WorkerFrame::Evt(WorkerEvent::StateChanged { running: false }),
                )
                .await;
                let _ = write_message(
                    write_half,
                    &WorkerFrame::Evt(WorkerEvent::Exit { exit_code, signal }),
                )
                .await;
                return;
            }
            Ok(RuntimeEvent::Output { .. }) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
