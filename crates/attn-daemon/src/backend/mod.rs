//! PTY backend abstraction.
//!
//! One capability-set interface over two runtimes: embedded (PTYs in the
//! daemon process, opt-in fallback) and worker sidecars (one
//! reconnectable child process per session, the default). Selection
//! happens once at construction via the config enum; session/backend
//! references flow through `session_id` keys, never bidirectional
//! handles.

mod embedded;
mod monitor;
mod recovery;
mod worker;

pub use embedded::EmbeddedBackend;
pub use worker::WorkerBackend;

use std::sync::Arc;

use async_trait::async_trait;
use attn_core::config::{DaemonConfig, PtyBackendKind};
use attn_paths::AttnPaths;
use attn_protocol::types::AttachInfo;
use attn_protocol::worker::WorkerSessionInfo;
use tokio::sync::mpsc;

use crate::errors::DaemonError;
use crate::identity::OwnershipLease;
use crate::types::{BackendEvents, PtyEvent, RecoveryReport, SpawnOptions};

#[async_trait]
pub trait PtyBackend: Send + Sync {
    async fn spawn(&self, opts: SpawnOptions) -> Result<(), DaemonError>;

    /// Attach a subscriber: returns the replay payload and a live event
    /// stream. Re-attaching an existing subscriber id closes its
    /// previous stream first.
    async fn attach(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(AttachInfo, mpsc::Receiver<PtyEvent>), DaemonError>;

    async fn detach(&self, session_id: &str, subscriber_id: &str) -> Result<(), DaemonError>;

    async fn input(&self, session_id: &str, bytes: &[u8]) -> Result<(), DaemonError>;

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), DaemonError>;

    async fn kill(&self, session_id: &str, signal: Option<&str>) -> Result<(), DaemonError>;

    async fn remove(&self, session_id: &str) -> Result<(), DaemonError>;

    async fn session_ids(&self) -> Vec<String>;

    async fn session_info(&self, session_id: &str) -> Result<WorkerSessionInfo, DaemonError>;

    /// Cheap liveness signal used by reconciliation to avoid demoting
    /// sessions whose runtime is plausibly alive.
    async fn session_likely_alive(&self, session_id: &str) -> bool;

    /// Scan persisted runtime state and re-register what is still live.
    async fn recover(&self) -> RecoveryReport;

    /// Stop monitors and close connections. Worker sidecars keep
    /// running; embedded sessions die with the daemon.
    async fn shutdown(&self);
}

/// Everything a backend needs at construction time.
pub struct BackendContext {
    pub paths: AttnPaths,
    pub instance_id: String,
    pub lease: OwnershipLease,
    pub config: Arc<DaemonConfig>,
    pub events: BackendEvents,
}

/// Construct the configured backend.
pub fn build_backend(kind: PtyBackendKind, ctx: BackendContext) -> Arc<dyn PtyBackend> {
    match kind {
        PtyBackendKind::Worker => Arc::new(WorkerBackend::new(ctx)),
        PtyBackendKind::Embedded => Arc::new(EmbeddedBackend::new(ctx)),
    }
}
