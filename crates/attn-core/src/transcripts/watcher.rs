//! Per-session transcript tail watcher.
//!
//! Emits a quiet-window event when the transcript stops changing for a
//! grace period — the second, hook-independent end-of-turn trigger. Each
//! watcher owns a file cursor (size + mtime), a quiet-window timer, and
//! an output channel; dropping the watcher stops the thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Poll cadence for the fallback size/mtime check.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Emitted when the transcript tail has been still for the grace period.
#[derive(Debug, Clone)]
pub struct QuietWindowEvent {
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub quiet_at: chrono::DateTime<chrono::Utc>,
}

pub struct TranscriptWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TranscriptWatcher {
    /// Watch `path` and send a `QuietWindowEvent` each time writes stop
    /// for `quiet_window`. Uses a filesystem watcher on the parent
    /// directory (the file may not exist yet) plus a size/mtime poll as a
    /// fallback for editors and filesystems that coalesce events.
    pub fn spawn(
        session_id: String,
        path: PathBuf,
        quiet_window: Duration,
        tx: mpsc::UnboundedSender<QuietWindowEvent>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name(format!("transcript-watch-{session_id}"))
            .spawn(move || watch_loop(session_id, path, quiet_window, tx, stop_flag))
            .ok();
        if handle.is_none() {
            warn!(event = "core.transcripts.watcher_spawn_failed");
        }

        Self {
            stop,
            handle,
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for TranscriptWatcher {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn fingerprint(path: &std::path::Path) -> Option<(u64, std::time::SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()?))
}

fn watch_loop(
    session_id: String,
    path: PathBuf,
    quiet_window: Duration,
    tx: mpsc::UnboundedSender<QuietWindowEvent>,
    stop: Arc<AtomicBool>,
) {
    let (fs_tx, fs_rx) = std::sync::mpsc::channel();
    let mut _watcher = None;
    if let Some(parent) = path.parent() {
        match notify::recommended_watcher(fs_tx) {
            Ok(mut w) => {
                if let Err(e) = w.watch(parent, RecursiveMode::NonRecursive) {
                    debug!(
                        event = "core.transcripts.watch_failed",
                        path = %parent.display(),
                        error = %e,
                    );
                } else {
                    _watcher = Some(w);
                }
            }
            Err(e) => {
                debug!(event = "core.transcripts.watcher_create_failed", error = %e);
            }
        }
    }

    let mut last_fingerprint = fingerprint(&path);
    let mut last_change: Option<Instant> = None;
    let mut quiet_sent = true; // nothing to report until the file changes

    while !stop.load(Ordering::Relaxed) {
        // Drain filesystem events touching our file.
        let mut fs_dirty = false;
        while let Ok(event) = fs_rx.try_recv() {
            if let Ok(event) = event
                && event.paths.iter().any(|p| p == &path)
            {
                fs_dirty = true;
            }
        }

        let current = fingerprint(&path);
        if fs_dirty || current != last_fingerprint {
            last_fingerprint = current;
            last_change = Some(Instant::now());
            quiet_sent = false;
        }

        if !quiet_sent
            && let Some(changed) = last_change
            && changed.elapsed() >= quiet_window
        {
            quiet_sent = true;
            debug!(
                event = "core.transcripts.quiet_window",
                session_id = %session_id,
                path = %path.display(),
            );
            if tx
                .send(QuietWindowEvent {
                    session_id: session_id.clone(),
                    transcript_path: path.clone(),
                    quiet_at: chrono::Utc::now(),
                })
                .is_err()
            {
                return; // receiver gone, session torn down
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_quiet_window_fires_after_write_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "line1\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = TranscriptWatcher::spawn(
            "s1".to_string(),
            path.clone(),
            Duration::from_millis(300),
            tx,
        );

        // Write, then go quiet.
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::fs::write(&path, "line1\nline2\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("quiet window should fire")
            .unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.transcript_path, path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_event_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "stable\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = TranscriptWatcher::spawn(
            "s1".to_string(),
            path,
            Duration::from_millis(100),
            tx,
        );

        let result = tokio::time::timeout(Duration::from_millis(700), rx.recv()).await;
        assert!(result.is_err(), "no writes means no quiet event");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_terminates_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let (tx, _rx) = mpsc::unbounded_channel();
        let watcher = TranscriptWatcher::spawn(
            "s1".to_string(),
            path,
            Duration::from_millis(100),
            tx,
        );
        watcher.stop();
        drop(watcher); // Drop joins the thread; must not hang.
    }
}
