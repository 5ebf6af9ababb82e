//! Daemon-side JSONL RPC client for worker sockets.
//!
//! Every call is bounded by an explicit deadline. Stream-mode
//! connections (attach, watch) clear per-RPC deadlines after the
//! handshake: the stream is expected to sit idle for arbitrary periods.

use std::path::Path;
use std::time::Duration;

use attn_protocol::codec::{read_message, write_message};
use attn_protocol::worker::{
    HelloParams, HelloResult, RPC_MAJOR, RPC_MINOR, WorkerCall, WorkerEvent, WorkerFrame,
    WorkerRequest, WorkerSessionInfo, error_codes,
};
use serde::de::DeserializeOwned;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::errors::DaemonError;

#[derive(Debug)]
pub struct WorkerRpc {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl WorkerRpc {
    /// Dial a worker socket under a deadline.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, DaemonError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| DaemonError::RpcTransient(format!("dial timeout: {}", path.display())))?
            .map_err(|e| DaemonError::RpcTransient(format!("dial {}: {e}", path.display())))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 0,
        })
    }

    /// Issue one request and wait (bounded) for its response. Event
    /// frames that arrive in between are skipped: they belong to streams
    /// and control connections never carry them.
    pub async fn call(
        &mut self,
        call: WorkerCall,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = WorkerFrame::Req(WorkerRequest { id, call });

        tokio::time::timeout(timeout, write_message(&mut self.writer, &frame))
            .await
            .map_err(|_| DaemonError::RpcTransient("write timeout".to_string()))??;

        loop {
            let frame: Option<WorkerFrame> =
                tokio::time::timeout(timeout, read_message(&mut self.reader))
                    .await
                    .map_err(|_| DaemonError::RpcTransient("read timeout".to_string()))??;
            match frame {
                Some(WorkerFrame::Res(res)) if res.id == id => {
                    if res.ok {
                        return Ok(res.result.unwrap_or(serde_json::Value::Null));
                    }
                    let err = res.error.unwrap_or(attn_protocol::worker::WorkerError {
                        code: "unknown".to_string(),
                        message: "missing error body".to_string(),
                    });
                    return Err(map_worker_error(&err.code, err.message));
                }
                Some(WorkerFrame::Res(_)) | Some(WorkerFrame::Evt(_)) => continue,
                Some(WorkerFrame::Req(_)) => {
                    return Err(DaemonError::RpcFatal(
                        "worker sent a request frame".to_string(),
                    ));
                }
                None => {
                    return Err(DaemonError::RpcTransient(
                        "connection closed mid-call".to_string(),
                    ));
                }
            }
        }
    }

    pub async fn call_typed<T: DeserializeOwned>(
        &mut self,
        call: WorkerCall,
        timeout: Duration,
    ) -> Result<T, DaemonError> {
        let value = self.call(call, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| DaemonError::RpcFatal(format!("malformed result: {e}")))
    }

    /// Version + identity handshake. `daemon_instance_id` must be the id
    /// recorded for the worker (its spawning daemon's) — reclaim paths
    /// authenticate with the registry entry's identity, not their own.
    pub async fn hello(
        &mut self,
        daemon_instance_id: &str,
        control_token: &str,
        timeout: Duration,
    ) -> Result<HelloResult, DaemonError> {
        self.call_typed(
            WorkerCall::Hello(HelloParams {
                rpc_major: RPC_MAJOR,
                rpc_min_minor: 0,
                daemon_instance_id: daemon_instance_id.to_string(),
                control_token: control_token.to_string(),
            }),
            timeout,
        )
        .await
    }

    pub async fn info(&mut self, timeout: Duration) -> Result<WorkerSessionInfo, DaemonError> {
        self.call_typed(WorkerCall::Info, timeout).await
    }

    pub async fn health(&mut self, timeout: Duration) -> Result<WorkerSessionInfo, DaemonError> {
        self.call_typed(WorkerCall::Health, timeout).await
    }

    /// Convert into a stream reader after an `attach` or `watch` call
    /// succeeded. No per-RPC deadline applies from here on.
    pub fn into_event_stream(self) -> WorkerEventStream {
        WorkerEventStream {
            reader: self.reader,
            _writer: self.writer,
        }
    }
}

/// Long-lived event stream from a worker. Reads have no deadline; the
/// monitor layer decides when a silent stream counts as broken.
pub struct WorkerEventStream {
    reader: BufReader<OwnedReadHalf>,
    // Held so the worker sees the connection as open.
    _writer: OwnedWriteHalf,
}

impl WorkerEventStream {
    /// Next event, or `None` on orderly close.
    pub async fn next_event(&mut self) -> Result<Option<WorkerEvent>, DaemonError> {
        loop {
            match read_message::<_, WorkerFrame>(&mut self.reader).await? {
                Some(WorkerFrame::Evt(event)) => return Ok(Some(event)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

fn map_worker_error(code: &str, message: String) -> DaemonError {
    match code {
        error_codes::SESSION_NOT_FOUND => DaemonError::SessionNotFound(message),
        error_codes::SESSION_NOT_RUNNING => DaemonError::SessionNotRunning(message),
        error_codes::UNSUPPORTED_VERSION => DaemonError::ProtocolMismatch(message),
        _ => DaemonError::RpcFatal(format!("{code}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attn_protocol::worker::WorkerResponse;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    async fn serve_one_response(
        listener: UnixListener,
        respond: impl FnOnce(WorkerRequest) -> WorkerFrame + Send + 'static,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let frame: WorkerFrame = read_message(&mut reader).await.unwrap().unwrap();
        let WorkerFrame::Req(req) = frame else {
            panic!("expected request");
        };
        let reply = respond(req);
        write_message(&mut write_half, &reply).await.unwrap();
        write_half.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkerRpc::connect(&dir.path().join("none.sock"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("w.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_one_response(listener, |req| {
            WorkerFrame::Res(WorkerResponse::ok(
                req.id,
                serde_json::json!({"running": true}),
            ))
        }));

        let mut rpc = WorkerRpc::connect(&sock, Duration::from_secs(1)).await.unwrap();
        let value = rpc
            .call(WorkerCall::Info, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value["running"], serde_json::json!(true));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_error_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("w.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_one_response(listener, |req| {
            WorkerFrame::Res(WorkerResponse::err(
                req.id,
                error_codes::SESSION_NOT_RUNNING,
                "child exited",
            ))
        }));

        let mut rpc = WorkerRpc::connect(&sock, Duration::from_secs(1)).await.unwrap();
        let err = rpc
            .call(WorkerCall::Info, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::SessionNotRunning(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("w.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        // Accept but never respond.
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut rpc = WorkerRpc::connect(&sock, Duration::from_secs(1)).await.unwrap();
        let err = rpc
            .call(WorkerCall::Info, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        server.abort();
    }

    #[tokio::test]
    async fn test_version_mismatch_maps_to_protocol_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("w.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_one_response(listener, |req| {
            WorkerFrame::Res(WorkerResponse::err(
                req.id,
                error_codes::UNSUPPORTED_VERSION,
                "rpc major 2 != 1",
            ))
        }));

        let mut rpc = WorkerRpc::connect(&sock, Duration::from_secs(1)).await.unwrap();
        let err = rpc
            .hello("d-1", "tok", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::ProtocolMismatch(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_stream_skips_responses() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("w.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_read_half, mut write_half) = stream.into_split();
            write_message(
                &mut write_half,
                &WorkerFrame::Res(WorkerResponse::ok(99, serde_json::Value::Null)),
            )
            .await
            .unwrap();
            write_message(
                &mut write_half,
                &WorkerFrame::Evt(WorkerEvent::Exit {
                    exit_code: Some(0),
                    signal: None,
                }),
            )
            .await
            .unwrap();
        });

        let rpc = WorkerRpc::connect(&sock, Duration::from_secs(1)).await.unwrap();
        let mut stream = rpc.into_event_stream();
        let event = stream.next_event().await.unwrap().unwrap();
        assert!(matches!(event, WorkerEvent::Exit { .. }));
        // Orderly close after the server task drops the socket.
        let end = stream.next_event().await.unwrap();
        assert!(end.is_none());
        server.await.unwrap();
    }
}
