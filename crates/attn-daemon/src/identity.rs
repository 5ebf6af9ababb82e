//! Daemon instance identity and ownership lease.
//!
//! The instance id is created on first start and reused forever after;
//! it names the worker tree on disk. The ownership lease is fresh per
//! daemon *process* and is embedded in every registry entry this process
//! writes, enabling authenticated reclaim after restarts.

use attn_paths::AttnPaths;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::DaemonError;

/// Load the persistent `daemon_instance_id`, creating it on first start.
pub fn load_or_create_instance_id(paths: &AttnPaths) -> Result<String, DaemonError> {
    let path = paths.daemon_id_file();
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let id = contents.trim().to_string();
            if !id.is_empty() {
                return Ok(id);
            }
            // Empty file: fall through and regenerate.
            Ok(create_instance_id(paths)?)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(create_instance_id(paths)?),
        Err(e) => Err(DaemonError::Io(e)),
    }
}

fn create_instance_id(paths: &AttnPaths) -> Result<String, DaemonError> {
    let id = uuid::Uuid::new_v4().to_string();
    let path = paths.daemon_id_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{id}\n"))?;
    info!(
        event = "daemon.identity.created",
        instance_id = %id,
        path = %path.display(),
    );
    Ok(id)
}

/// The `(pid, started_at, nonce)` triple this daemon process embeds in
/// registry entries it writes.
#[derive(Debug, Clone)]
pub struct OwnershipLease {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub nonce: String,
}

impl OwnershipLease {
    /// Generate exactly once per daemon process, in the startup
    /// orchestrator.
    pub fn generate() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }
}
