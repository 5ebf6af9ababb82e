//! PID lock for daemon single-instance enforcement.
//!
//! A live peer is never displaced: if the lock holder is alive, startup
//! is refused. Stale locks (dead holder) are cleaned up silently.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::errors::DaemonError;

/// Write the current process PID to the lock file.
pub fn write_pid_file(path: &Path) -> Result<(), DaemonError> {
    let pid = std::process::id();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))?;
    debug!(event = "daemon.pid.write_completed", pid = pid, path = %path.display());
    Ok(())
}

/// Read the PID from the lock file. Returns `None` if the file doesn't
/// exist or contains invalid content.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(
                event = "daemon.pid.read_failed",
                path = %path.display(),
                error = %e,
            );
            return None;
        }
    };
    match content.trim().parse::<u32>() {
        Ok(pid) => Some(pid),
        Err(_) => {
            warn!(
                event = "daemon.pid.parse_failed",
                path = %path.display(),
                content = %content.trim(),
            );
            None
        }
    }
}

pub fn remove_pid_file(path: &Path) -> Result<(), DaemonError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(event = "daemon.pid.remove_completed", path = %path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DaemonError::Io(e)),
    }
}

/// Check whether a process with the given PID is alive.
///
/// Uses `kill(pid, 0)` which checks existence without sending a signal.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Acquire the PID lock, refusing to start when a live daemon holds it.
/// A stale lock from a dead process is removed and re-acquired.
pub fn acquire_pid_lock(path: &Path) -> Result<(), DaemonError> {
    if let Some(existing) = read_pid_file(path) {
        if is_process_alive(existing) {
            return Err(DaemonError::AlreadyRunning(existing));
        }
        warn!(
            event = "daemon.pid.stale_detected",
            pid = existing,
            path = %path.display(),
        );
        remove_pid_file(path)?;
    }
    write_pid_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("attn.pid");

        write_pid_file(&pid_path).unwrap();

        let pid = read_pid_file(&pid_path);
        assert_eq!(pid, Some(std::process::id()));
    }

    #[test]
    fn test_read_missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_pid_file(&dir.path().join("none.pid")).is_none());
    }

    #[test]
    fn test_read_corrupt_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("attn.pid");
        fs::write(&pid_path, "not_a_number\n").unwrap();
        assert!(read_pid_file(&pid_path).is_none());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_pid_file(&dir.path().join("none.pid")).unwrap();
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(4_294_967));
    }

    #[test]
    fn test_acquire_refuses_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("attn.pid");
        // Current process is definitely alive.
        write_pid_file(&pid_path).unwrap();

        let err = acquire_pid_lock(&pid_path).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
        // Lock file untouched.
        assert_eq!(read_pid_file(&pid_path), Some(std::process::id()));
    }

    #[test]
    fn test_acquire_reclaims_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("attn.pid");
        fs::write(&pid_path, "4294967\n").unwrap();

        acquire_pid_lock(&pid_path).unwrap();
        assert_eq!(read_pid_file(&pid_path), Some(std::process::id()));
    }

    #[test]
    fn test_acquire_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("attn.pid");
        acquire_pid_lock(&pid_path).unwrap();
        assert_eq!(read_pid_file(&pid_path), Some(std::process::id()));
    }
}
