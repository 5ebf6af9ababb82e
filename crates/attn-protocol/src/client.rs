//! Synchronous JSONL IPC client for the control socket.
//!
//! Used by the CLI and the hook relay subcommands, which are short-lived
//! blocking processes — no async runtime is spun up for a single
//! request/reply exchange.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::hook::{HookMessage, HookReply};

/// Error from the synchronous IPC client layer.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("daemon is not running (socket not found at {path})")]
    NotRunning { path: String },

    #[error("connection failed: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("daemon error: {message}")]
    DaemonError { message: String },

    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A synchronous JSONL connection to the daemon control socket.
#[derive(Debug)]
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    /// Connect to the control socket.
    ///
    /// Checks that the socket file exists, connects, and configures
    /// timeouts (10s read, 5s write). Returns `IpcError::NotRunning` if
    /// the socket doesn't exist or the connection is refused.
    pub fn connect(socket_path: &Path) -> Result<Self, IpcError> {
        if !socket_path.exists() {
            return Err(IpcError::NotRunning {
                path: socket_path.display().to_string(),
            });
        }

        let stream = UnixStream::connect(socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning {
                    path: socket_path.display().to_string(),
                }
            } else {
                IpcError::ConnectionFailed(e)
            }
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        Ok(Self { stream })
    }

    /// Send one message and read one reply line.
    ///
    /// A `HookReply` with `ok: false` converts into `IpcError::DaemonError`.
    pub fn send(&mut self, request: &HookMessage) -> Result<HookReply, IpcError> {
        let msg = serde_json::to_string(request).map_err(|e| IpcError::ProtocolError {
            message: e.to_string(),
        })?;

        writeln!(self.stream, "{msg}")?;
        self.stream.flush()?;

        // Transient BufReader — the protocol is strictly one reply line per
        // send, so no buffered bytes can be stranded between calls.
        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;

        if line.is_empty() {
            return Err(IpcError::ProtocolError {
                message: "empty response from daemon".to_string(),
            });
        }

        let reply: HookReply =
            serde_json::from_str(&line).map_err(|e| IpcError::ProtocolError {
                message: format!("invalid JSON response: {e}"),
            })?;

        if !reply.ok {
            return Err(IpcError::DaemonError {
                message: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        Ok(reply)
    }
}

/// One-shot helper: connect, send, disconnect.
pub fn send_to_daemon(socket_path: &Path, request: &HookMessage) -> Result<HookReply, IpcError> {
    IpcConnection::connect(socket_path)?.send(request)
}
