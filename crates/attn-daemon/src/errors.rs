use std::io;

/// All error types for the attn-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("recovery in progress")]
    Recovering,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session not running: {0}")]
    SessionNotRunning(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("transient RPC failure: {0}")]
    RpcTransient(String),

    #[error("fatal RPC failure: {0}")]
    RpcFatal(String),

    #[error("registry entry disputes daemon identity: {0}")]
    OwnershipMismatch(String),

    #[error("registry socket path violates derivation rule: {0}")]
    SocketPathMismatch(String),

    #[error("client outbound queue saturated")]
    SlowClient,

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("worker spawn failed: {0}")]
    WorkerSpawn(String),

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("wire error: {0}")]
    Wire(#[from] attn_protocol::WireError),

    #[error("path error: {0}")]
    Path(#[from] attn_paths::PathError),

    #[error("session error: {0}")]
    Session(#[from] attn_core::SessionError),

    #[error("config error: {0}")]
    Config(#[from] attn_core::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] attn_store::StoreError),
}

impl DaemonError {
    /// Error code string for the wire protocols.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::Recovering => "daemon_recovering",
            DaemonError::SessionNotFound(_) => "session_not_found",
            DaemonError::SessionNotRunning(_) => "session_not_running",
            DaemonError::SessionAlreadyExists(_) => "session_already_exists",
            DaemonError::ProtocolMismatch(_) => "protocol_mismatch",
            DaemonError::RpcTransient(_) => "rpc_transient",
            DaemonError::RpcFatal(_) => "rpc_fatal",
            DaemonError::OwnershipMismatch(_) => "ownership_mismatch",
            DaemonError::SocketPathMismatch(_) => "socket_path_mismatch",
            DaemonError::SlowClient => "slow_client",
            DaemonError::Pty(_) => "pty_error",
            DaemonError::WorkerSpawn(_) => "worker_spawn_failed",
            DaemonError::AlreadyRunning(_) => "daemon_already_running",
            DaemonError::BadRequest(_) => "bad_request",
            DaemonError::Io(_) => "io_error",
            DaemonError::Serde(_) => "serialization_error",
            DaemonError::Base64(_) => "base64_decode_error",
            DaemonError::Wire(_) => "protocol_error",
            DaemonError::Path(_) => "path_error",
            DaemonError::Session(e) => e.error_code(),
            DaemonError::Config(_) => "config_invalid",
            DaemonError::Store(_) => "store_degraded",
        }
    }

    /// Transient errors are retried (recovery probes, monitors); fatal
    /// ones quarantine or surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaemonError::RpcTransient(_) | DaemonError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(DaemonError, &str)> = vec![
            (DaemonError::Recovering, "daemon_recovering"),
            (
                DaemonError::SessionNotFound("x".to_string()),
                "session_not_found",
            ),
            (
                DaemonError::SessionNotRunning("x".to_string()),
                "session_not_running",
            ),
            (
                DaemonError::ProtocolMismatch("major 2 != 1".to_string()),
                "protocol_mismatch",
            ),
            (
                DaemonError::RpcTransient("timeout".to_string()),
                "rpc_transient",
            ),
            (DaemonError::RpcFatal("bad hello".to_string()), "rpc_fatal"),
            (
                DaemonError::OwnershipMismatch("d-2".to_string()),
                "ownership_mismatch",
            ),
            (
                DaemonError::SocketPathMismatch("/tmp/x.sock".to_string()),
                "socket_path_mismatch",
            ),
            (DaemonError::SlowClient, "slow_client"),
            (DaemonError::AlreadyRunning(42), "daemon_already_running"),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(DaemonError::RpcTransient("t".to_string()).is_transient());
        assert!(!DaemonError::RpcFatal("f".to_string()).is_transient());
        assert!(!DaemonError::SlowClient.is_transient());
    }
}
