pub mod codec;
pub mod commands;
pub mod events;
pub mod hook;
pub mod types;
pub mod worker;

#[cfg(unix)]
pub mod client;

#[cfg(unix)]
pub use client::{IpcConnection, IpcError};
pub use codec::{WireError, read_message, write_message};
pub use commands::ClientCommand;
pub use events::DaemonEvent;
pub use hook::{HookMessage, HookReply};
pub use types::{
    AgentKind, AttachInfo, DaemonStatusInfo, PrInfo, RecentLocation, ScreenSnapshot, SessionId,
    SessionSnapshot, SessionState, TodoItem, UserSettings,
};
pub use worker::{
    HelloParams, HelloResult, RPC_MAJOR, RPC_MINOR, WorkerCall, WorkerError, WorkerEvent,
    WorkerFrame, WorkerRequest, WorkerResponse, WorkerSessionInfo, WorkerSpawnSpec,
};

/// WebSocket protocol version. Bumped on any wire change.
pub const PROTOCOL_VERSION: &str = "3";
