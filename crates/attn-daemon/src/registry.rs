//! Worker registry: the on-disk truth recovery works from.
//!
//! One JSON file per session, written atomically (temp file + rename in
//! the same directory). Rejected entries are never deleted outright —
//! they move into `quarantine/` with a reason suffix so operators can
//! inspect what recovery refused and why.

use std::path::{Path, PathBuf};

use attn_paths::AttnPaths;
use attn_protocol::worker::{REGISTRY_VERSION, RegistryEntry};
use chrono::Utc;
use tracing::{info, warn};

use crate::errors::DaemonError;

/// Why a registry entry failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRejection {
    UnsupportedVersion(u32),
    InvalidSessionId,
    SocketPathMismatch,
}

impl EntryRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            EntryRejection::UnsupportedVersion(_) => "unsupported_version",
            EntryRejection::InvalidSessionId => "invalid_session_id",
            EntryRejection::SocketPathMismatch => "socket_path_mismatch",
        }
    }
}

/// Validate an entry against the derivation rules.
///
/// The socket path must match the derivation for `(data_root,
/// entry.daemon_instance_id, session_id)` in either the current base32
/// form or the legacy `h-<hex>` form. The instance id used is the
/// *entry's*: foreign entries validate against their own tree, ownership
/// is judged separately.
pub fn validate_entry(paths: &AttnPaths, entry: &RegistryEntry) -> Result<(), EntryRejection> {
    if entry.version > REGISTRY_VERSION {
        return Err(EntryRejection::UnsupportedVersion(entry.version));
    }
    if !attn_paths::is_valid_session_id(&entry.session_id) {
        return Err(EntryRejection::InvalidSessionId);
    }
    if !paths.socket_path_matches(
        &entry.daemon_instance_id,
        &entry.session_id,
        &entry.socket_path,
    ) {
        return Err(EntryRejection::SocketPathMismatch);
    }
    Ok(())
}

/// Atomically write a registry entry (temp file + rename).
pub fn write_entry(
    paths: &AttnPaths,
    instance_id: &str,
    entry: &RegistryEntry,
) -> Result<PathBuf, DaemonError> {
    let dir = paths.worker_registry_dir(instance_id);
    std::fs::create_dir_all(&dir)?;
    let path = paths.worker_registry_file(instance_id, &entry.session_id);
    let tmp = dir.join(format!(".{}.tmp", entry.session_id));
    std::fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
    std::fs::rename(&tmp, &path)?;
    info!(
        event = "daemon.registry.entry_written",
        session_id = %entry.session_id,
        worker_pid = entry.worker_pid,
        path = %path.display(),
    );
    Ok(path)
}

pub fn read_entry(path: &Path) -> Result<RegistryEntry, DaemonError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Enumerate registry files for an instance (`*.json`, non-hidden).
pub fn list_entries(paths: &AttnPaths, instance_id: &str) -> Vec<PathBuf> {
    let dir = paths.worker_registry_dir(instance_id);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "json")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    files.sort();
    files
}

/// Remove an entry and its socket, but only unlink sockets that live
/// inside the instance's `sock/` directory.
pub fn prune_entry(
    paths: &AttnPaths,
    entry_path: &Path,
    entry: &RegistryEntry,
) -> Result<(), DaemonError> {
    if let Err(e) = std::fs::remove_file(entry_path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(
            event = "daemon.registry.prune_unlink_failed",
            path = %entry_path.display(),
            error = %e,
        );
    }
    remove_socket_if_owned(paths, entry);
    info!(
        event = "daemon.registry.entry_pruned",
        session_id = %entry.session_id,
    );
    Ok(())
}

/// Unlink the entry's socket iff it sits in its instance's sock dir.
pub fn remove_socket_if_owned(paths: &AttnPaths, entry: &RegistryEntry) {
    let sock_dir = paths.worker_sock_dir(&entry.daemon_instance_id);
    if entry.socket_path.parent() == Some(sock_dir.as_path()) {
        if let Err(e) = std::fs::remove_file(&entry.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                event = "daemon.registry.socket_unlink_failed",
                path = %entry.socket_path.display(),
                error = %e,
            );
        }
    } else {
        warn!(
            event = "daemon.registry.socket_outside_sock_dir",
            path = %entry.socket_path.display(),
        );
    }
}

/// Move a rejected entry into `quarantine/`, suffixed with the reason
/// and a unix timestamp. The worker socket is left alone.
pub fn quarantine_entry(
    paths: &AttnPaths,
    instance_id: &str,
    entry_path: &Path,
    reason: &str,
) -> Result<PathBuf, DaemonError> {
    let dir = paths.worker_quarantine_dir(instance_id);
    std::fs::create_dir_all(&dir)?;
    let name = entry_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry.json");
    let target = dir.join(format!("{name}.{reason}.{}", Utc::now().timestamp()));
    std::fs::rename(entry_path, &target)?;
    warn!(
        event = "daemon.registry.entry_quarantined",
        from = %entry_path.display(),
        to = %target.display(),
        reason = reason,
    );
    Ok(target)
}
