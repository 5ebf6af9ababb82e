//! Worker recovery scan.
//!
//! Enumerates every instance tree under `workers/`, validates each
//! registry entry, settles ownership for entries written under a
//! different daemon identity, prunes dead workers, and probes the rest
//! with bounded retries. Outcomes are total: after the scan, every entry
//! either backs an in-memory session, was pruned, was quarantined with a
//! recorded reason, or is explicitly deferred for the background
//! reconciler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use attn_protocol::worker::{RegistryEntry, WorkerCall};
use tracing::{debug, info, warn};

use super::worker::{WorkerBackend, probe_worker};
use crate::errors::DaemonError;
use crate::pid::is_process_alive;
use crate::registry;
use crate::rpc::WorkerRpc;
use crate::types::RecoveryReport;

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_BACKOFF_MS: u64 = 200;

pub(super) async fn recover_worker_backend(backend: &WorkerBackend) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    for (instance_id, entry_path) in enumerate_entries(backend) {
        let session_label = entry_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if backend.is_registered(&session_label).await {
            continue;
        }

        let entry = match registry::read_entry(&entry_path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    event = "daemon.recovery.entry_unreadable",
                    path = %entry_path.display(),
                    error = %e,
                );
                quarantine(backend, &instance_id, &entry_path, "unparseable", &mut report);
                continue;
            }
        };

        if let Err(rejection) = registry::validate_entry(&backend.ctx.paths, &entry) {
            quarantine(
                backend,
                &instance_id,
                &entry_path,
                rejection.reason(),
                &mut report,
            );
            continue;
        }

        if entry.daemon_instance_id != backend.ctx.instance_id {
            settle_foreign_entry(backend, &instance_id, &entry_path, entry, &mut report).await;
            continue;
        }

        if !is_process_alive(entry.worker_pid) {
            info!(
                event = "daemon.recovery.dead_worker_pruned",
                session_id = %entry.session_id,
                worker_pid = entry.worker_pid,
            );
            let _ = registry::prune_entry(&backend.ctx.paths, &entry_path, &entry);
            report.pruned.push(entry.session_id);
            continue;
        }

        probe_and_register(backend, &instance_id, entry_path, entry, &mut report).await;
    }

    info!(
        event = "daemon.recovery.scan_completed",
        recovered = report.recovered.len(),
        pruned = report.pruned.len(),
        quarantined = report.quarantined.len(),
        deferred = report.deferred.len(),
    );
    report
}

/// All registry files across every instance tree under `workers/`.
fn enumerate_entries(backend: &WorkerBackend) -> Vec<(String, PathBuf)> {
    let workers_root = backend.ctx.paths.data_root().join("workers");
    let Ok(instances) = std::fs::read_dir(&workers_root) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for instance in instances.flatten() {
        if !instance.path().is_dir() {
            continue;
        }
        let instance_id = instance.file_name().to_string_lossy().to_string();
        for path in registry::list_entries(&backend.ctx.paths, &instance_id) {
            out.push((instance_id.clone(), path));
        }
    }
    out.sort();
    out
}

fn quarantine(
    backend: &WorkerBackend,
    instance_id: &str,
    entry_path: &Path,
    reason: &str,
    report: &mut RecoveryReport,
) {
    let label = entry_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Err(e) =
        registry::quarantine_entry(&backend.ctx.paths, instance_id, entry_path, reason)
    {
        warn!(
            event = "daemon.recovery.quarantine_failed",
            path = %entry_path.display(),
            error = %e,
        );
    }
    report.quarantined.push((label, reason.to_string()));
}

/// An entry recorded under a different daemon identity. Reclaim is only
/// attempted when ownership is provably stale: the recorded owner is
/// this very process (fresh identity after a clean restart) or the owner
/// PID is dead. Successful authenticated remove prunes the worker's
/// socket (inside its own sock dir only) and retires the entry to
/// quarantine as an audit record; everything else quarantines without
/// touching the socket.
async fn settle_foreign_entry(
    backend: &WorkerBackend,
    instance_id: &str,
    entry_path: &Path,
    entry: RegistryEntry,
    report: &mut RecoveryReport,
) {
    let lease = &backend.ctx.lease;
    let owner_is_self = entry.owner_pid == lease.pid && entry.owner_nonce == lease.nonce;
    let proven_stale = owner_is_self || !is_process_alive(entry.owner_pid);
    if !proven_stale {
        warn!(
            event = "daemon.recovery.ownership_disputed",
            session_id = %entry.session_id,
            recorded_instance = %entry.daemon_instance_id,
            owner_pid = entry.owner_pid,
        );
        quarantine(backend, instance_id, entry_path, "ownership_mismatch", report);
        return;
    }

    let timeout = Duration::from_millis(backend.ctx.config.rpc_reclaim_timeout_ms);
    match authenticated_remove(&entry, timeout).await {
        Ok(()) => {
            info!(
                event = "daemon.recovery.worker_reclaimed",
                session_id = %entry.session_id,
            );
            registry::remove_socket_if_owned(&backend.ctx.paths, &entry);
            quarantine(backend, instance_id, entry_path, "ownership_reclaimed", report);
            report.pruned.push(entry.session_id);
        }
        Err(e) if !is_process_alive(entry.worker_pid) => {
            // Worker already gone; nothing to authenticate against.
            debug!(
                event = "daemon.recovery.reclaim_target_dead",
                session_id = %entry.session_id,
                error = %e,
            );
            let _ = registry::prune_entry(&backend.ctx.paths, entry_path, &entry);
            report.pruned.push(entry.session_id);
        }
        Err(e) => {
            warn!(
                event = "daemon.recovery.reclaim_failed",
                session_id = %entry.session_id,
                error = %e,
            );
            quarantine(backend, instance_id, entry_path, "reclaim_failed", report);
        }
    }
}

/// Authenticate with the entry's own recorded identity and token — the
/// registry file is the proof of ownership — and ask the worker to exit.
async fn authenticated_remove(entry: &RegistryEntry, timeout: Duration) -> Result<(), DaemonError> {
    let mut rpc = WorkerRpc::connect(&entry.socket_path, timeout).await?;
    rpc.hello(&entry.daemon_instance_id, &entry.control_token, timeout)
        .await?;
    rpc.call(
        WorkerCall::Remove {
            control_token: entry.control_token.clone(),
        },
        timeout,
    )
    .await?;
    Ok(())
}

async fn probe_and_register(
    backend: &WorkerBackend,
    instance_id: &str,
    entry_path: PathBuf,
    entry: RegistryEntry,
    report: &mut RecoveryReport,
) {
    let timeout = Duration::from_millis(backend.ctx.config.rpc_default_timeout_ms);
    let mut backoff = Duration::from_millis(PROBE_BACKOFF_MS);
    let mut last_error: Option<DaemonError> = None;

    for attempt in 0..PROBE_ATTEMPTS {
        match probe_worker(&entry, timeout).await {
            Ok(info) => {
                debug!(
                    event = "daemon.recovery.probe_succeeded",
                    session_id = %entry.session_id,
                    running = info.running,
                    attempt = attempt,
                );
                let session_id = entry.session_id.clone();
                backend.register_session(entry, entry_path).await;
                report.recovered.push(session_id);
                return;
            }
            Err(e) if e.is_transient() => {
                debug!(
                    event = "daemon.recovery.probe_transient_failure",
                    session_id = %entry.session_id,
                    attempt = attempt,
                    error = %e,
                );
                last_error = Some(e);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                warn!(
                    event = "daemon.recovery.probe_fatal_failure",
                    session_id = %entry.session_id,
                    error = %e,
                );
                quarantine(backend, instance_id, &entry_path, "rpc_fatal", report);
                return;
            }
        }
    }

    // Transient failure all the way down: defer, do not demote.
    debug!(
        event = "daemon.recovery.probe_deferred",
        session_id = %entry.session_id,
        error = ?last_error.map(|e| e.to_string()),
    );
    report.deferred.push(entry.session_id);
}
