use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::SessionState;

/// RPC version spoken between daemon and pty-worker. The major must match
/// exactly; a peer is compatible when our minor is at least the minimum
/// minor it declares.
pub const RPC_MAJOR: u32 = 1;
pub const RPC_MINOR: u32 = 1;

/// Worker RPC error codes.
pub mod error_codes {
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
    pub const SESSION_NOT_RUNNING: &str = "session_not_running";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNSUPPORTED_VERSION: &str = "unsupported_version";
}

/// A single JSONL frame on a worker socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerFrame {
    #[serde(rename = "req")]
    Req(WorkerRequest),
    #[serde(rename = "res")]
    Res(WorkerResponse),
    #[serde(rename = "evt")]
    Evt(WorkerEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    #[serde(flatten)]
    pub call: WorkerCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum WorkerCall {
    Hello(HelloParams),
    Info,
    Attach { subscriber_id: String },
    Detach { subscriber_id: String },
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Signal { name: String },
    Remove { control_token: String },
    Health,
    Watch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
}

impl WorkerResponse {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WorkerError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerError {
    pub code: String,
    pub message: String,
}

/// Events pushed by the worker on attach and watch streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "evt", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// PTY output chunk (attach streams only).
    Output { data: String, seq: u64 },
    /// The subscriber's queue overflowed; the stream closes after this.
    Desync { reason: String },
    /// Heuristic state hint derived from terminal output patterns.
    StateHint { state: SessionState },
    /// The child's running flag flipped (watch streams only).
    StateChanged { running: bool },
    /// The child process exited.
    Exit {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub rpc_major: u32,
    /// Minimum minor version the caller requires.
    pub rpc_min_minor: u32,
    pub daemon_instance_id: String,
    pub control_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub daemon_instance_id: String,
    pub session_id: String,
    pub rpc_major: u32,
    pub rpc_minor: u32,
}

/// Session info as reported by the worker's `info`/`health` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSessionInfo {
    pub session_id: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    pub last_seq: u64,
    pub attached_subscribers: usize,
}

/// Spawn parameters handed to a pty-worker as one JSON line on stdin.
///
/// Travels over stdin rather than argv: agent command lines carry
/// arbitrary user content that must not leak into `ps` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpawnSpec {
    pub version: u32,
    pub session_id: String,
    pub socket_path: PathBuf,
    pub daemon_instance_id: String,
    pub control_token: String,
    pub cwd: PathBuf,
    /// Program to run; `None` means the user's default shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_bytes: usize,
    /// Agent kind string; drives output heuristics inside the worker.
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_path: Option<PathBuf>,
}

/// Registry-file version understood by this build.
pub const REGISTRY_VERSION: u32 = 1;

/// On-disk worker registry entry, one file per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub version: u32,
    pub session_id: String,
    pub socket_path: PathBuf,
    pub worker_pid: u32,
    pub control_token: String,
    /// Daemon that originally spawned the worker.
    pub daemon_instance_id: String,
    /// Ownership lease of the daemon process that wrote this entry.
    pub owner_pid: u32,
    pub owner_started_at: chrono::DateTime<chrono::Utc>,
    pub owner_nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = WorkerRequest {
            id: 7,
            call: WorkerCall::Resize { cols: 120, rows: 40 },
        };
        let json = serde_json::to_string(&WorkerFrame::Req(req)).unwrap();
        assert!(json.contains(r#""type":"req""#));
        assert!(json.contains(r#""method":"resize""#));
        assert!(json.contains(r#""params":{"#));
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerFrame::Req(WorkerRequest {
                id,
                call: WorkerCall::Resize { cols, rows },
            }) => {
                assert_eq!(id, 7);
                assert_eq!((cols, rows), (120, 40));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unit_method_has_no_params() {
        let req = WorkerRequest {
            id: 1,
            call: WorkerCall::Info,
        };
        let json = serde_json::to_string(&WorkerFrame::Req(req)).unwrap();
        assert!(json.contains(r#""method":"info""#));
        assert!(!json.contains("params"));
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkerFrame::Req(WorkerRequest {
                call: WorkerCall::Info,
                ..
            })
        ));
    }

    #[test]
    fn test_hello_roundtrip() {
        let req = WorkerRequest {
            id: 1,
            call: WorkerCall::Hello(HelloParams {
                rpc_major: RPC_MAJOR,
                rpc_min_minor: 0,
                daemon_instance_id: "d-1".to_string(),
                control_token: "tok".to_string(),
            }),
        };
        let json = serde_json::to_string(&WorkerFrame::Req(req)).unwrap();
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerFrame::Req(WorkerRequest {
                call: WorkerCall::Hello(p),
                ..
            }) => {
                assert_eq!(p.rpc_major, RPC_MAJOR);
                assert_eq!(p.daemon_instance_id, "d-1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_response_helpers() {
        let ok = WorkerResponse::ok(3, serde_json::json!({"running": true}));
        assert!(ok.ok);
        assert!(ok.error.is_none());

        let err = WorkerResponse::err(4, error_codes::SESSION_NOT_RUNNING, "child exited");
        assert!(!err.ok);
        let e = err.error.unwrap();
        assert_eq!(e.code, "session_not_running");

        let json = serde_json::to_string(&WorkerFrame::Res(ok)).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_event_output_roundtrip() {
        let evt = WorkerFrame::Evt(WorkerEvent::Output {
            data: "aGkK".to_string(),
            seq: 9,
        });
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""evt":"output""#));
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkerFrame::Evt(WorkerEvent::Output { seq: 9, .. })
        ));
    }

    #[test]
    fn test_event_state_hint_roundtrip() {
        let evt = WorkerFrame::Evt(WorkerEvent::StateHint {
            state: SessionState::PendingApproval,
        });
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains(r#""state":"pending_approval""#));
    }

    #[test]
    fn test_spawn_spec_roundtrip() {
        let spec = WorkerSpawnSpec {
            version: 1,
            session_id: "s1".to_string(),
            socket_path: PathBuf::from("/tmp/x.sock"),
            daemon_instance_id: "d-1".to_string(),
            control_token: "tok".to_string(),
            cwd: PathBuf::from("/tmp"),
            command: Some("claude".to_string()),
            args: vec!["--resume".to_string(), "abc".to_string()],
            env: vec![("ATTN_SESSION_ID".to_string(), "s1".to_string())],
            cols: 80,
            rows: 24,
            scrollback_bytes: 8 * 1024 * 1024,
            agent: "claude".to_string(),
            capture_path: None,
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: WorkerSpawnSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.args.len(), 2);
        assert!(parsed.capture_path.is_none());
    }

    #[test]
    fn test_registry_entry_roundtrip() {
        let entry = RegistryEntry {
            version: REGISTRY_VERSION,
            session_id: "s1".to_string(),
            socket_path: PathBuf::from("/home/u/.attn/workers/d-1/sock/ab.sock"),
            worker_pid: 4242,
            control_token: "tok".to_string(),
            daemon_instance_id: "d-1".to_string(),
            owner_pid: 100,
            owner_started_at: chrono::Utc::now(),
            owner_nonce: "n-1".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: RegistryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker_pid, 4242);
        assert_eq!(parsed.version, REGISTRY_VERSION);
    }
}
