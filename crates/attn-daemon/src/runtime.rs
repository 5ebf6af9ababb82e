//! Shared per-session PTY runtime.
//!
//! Both backends run the same machinery: a portable-pty pair, a blocking
//! reader thread feeding the sequence-tagged scrollback ring, the vt100
//! screen, heuristic scanning, optional debug capture, and a broadcast
//! channel of runtime events. The embedded backend holds runtimes in the
//! daemon process; the worker process holds exactly one.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use attn_protocol::types::{AgentKind, AttachInfo, SessionState};
use attn_protocol::worker::WorkerSessionInfo;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::errors::DaemonError;
use crate::screen::VirtualScreen;
use crate::scrollback::SeqScrollback;
use crate::types::SpawnOptions;

/// Upper bound on one debug capture file before it restarts.
const CAPTURE_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Events fanned out to attach subscribers and lifecycle watchers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Output { seq: u64, bytes: Vec<u8> },
    Hint(SessionState),
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

struct RuntimeInner {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    scrollback: SeqScrollback,
    screen: VirtualScreen,
    cols: u16,
    rows: u16,
    running: bool,
    exit_code: Option<i32>,
    exit_signal: Option<String>,
    child_pid: Option<u32>,
}

pub struct PtySessionRuntime {
    session_id: String,
    inner: Arc<Mutex<RuntimeInner>>,
    /// Writer to PTY stdin. Separate lock so keystrokes never contend
    /// with the reader thread holding the inner lock.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl PtySessionRuntime {
    pub fn spawn(
        opts: &SpawnOptions,
        scrollback_bytes: usize,
        subscriber_buffer: usize,
        capture_path: Option<PathBuf>,
    ) -> Result<Self, DaemonError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| DaemonError::Pty(format!("openpty: {e}")))?;

        let mut cmd = match &opts.command {
            Some(program) => {
                let mut cmd = CommandBuilder::new(program);
                cmd.args(&opts.args);
                cmd
            }
            None => CommandBuilder::new_default_prog(),
        };
        cmd.cwd(&opts.cwd);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        info!(
            event = "daemon.runtime.spawn_started",
            session_id = %opts.session_id,
            command = ?opts.command,
            cols = opts.cols,
            rows = opts.rows,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::Pty(format!("spawn: {e}")))?;
        let child_pid = child.process_id();

        // Writer can only be taken once.
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::Pty(format!("take writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::Pty(format!("clone reader: {e}")))?;

        let (events, _) = broadcast::channel(subscriber_buffer.max(16));
        let inner = Arc::new(Mutex::new(RuntimeInner {
            master: pair.master,
            child,
            scrollback: SeqScrollback::new(scrollback_bytes),
            screen: VirtualScreen::new(opts.rows, opts.cols),
            cols: opts.cols,
            rows: opts.rows,
            running: true,
            exit_code: None,
            exit_signal: None,
            child_pid,
        }));

        let runtime = Self {
            session_id: opts.session_id.clone(),
            inner: inner.clone(),
            writer: Arc::new(Mutex::new(writer)),
            events: events.clone(),
        };

        spawn_reader_thread(
            opts.session_id.clone(),
            opts.agent,
            reader,
            inner,
            events,
            capture_path,
        );

        info!(
            event = "daemon.runtime.spawn_completed",
            session_id = %opts.session_id,
            pid = ?child_pid,
        );
        Ok(runtime)
    }

    fn lock_inner(&self) -> MutexGuard<'_, RuntimeInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.lock_inner().running
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.lock_inner().child_pid
    }

    /// Write bytes to PTY stdin.
    pub fn input(&self, data: &[u8]) -> Result<(), DaemonError> {
        if !self.is_running() {
            return Err(DaemonError::SessionNotRunning(self.session_id.clone()));
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| DaemonError::Pty("writer lock poisoned".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| DaemonError::Pty(format!("write stdin: {e}")))?;
        writer
            .flush()
            .map_err(|e| DaemonError::Pty(format!("flush stdin: {e}")))?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), DaemonError> {
        let mut inner = self.lock_inner();
        inner
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DaemonError::Pty(format!("resize: {e}")))?;
        inner.cols = cols;
        inner.rows = rows;
        inner.screen.resize(rows, cols);
        debug!(
            event = "daemon.runtime.resize_completed",
            session_id = %self.session_id,
            cols = cols,
            rows = rows,
        );
        Ok(())
    }

    /// Deliver a signal to the child. `None` kills outright.
    pub fn kill(&self, signal: Option<&str>) -> Result<(), DaemonError> {
        let mut inner = self.lock_inner();
        if !inner.running {
            return Err(DaemonError::SessionNotRunning(self.session_id.clone()));
        }
        match (signal, inner.child_pid) {
            (Some(name), Some(pid)) => {
                let sig = signal_by_name(name)
                    .ok_or_else(|| DaemonError::BadRequest(format!("unknown signal: {name}")))?;
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
                    .map_err(|e| DaemonError::Pty(format!("kill: {e}")))?;
            }
            _ => {
                inner
                    .child
                    .kill()
                    .map_err(|e| DaemonError::Pty(format!("kill: {e}")))?;
            }
        }
        Ok(())
    }

    /// Atomically snapshot scrollback + screen and subscribe to live
    /// events. Output events are only published under the inner lock, so
    /// the replay and the subscription are gap-free and overlap-free.
    pub fn attach_snapshot(&self) -> (AttachInfo, broadcast::Receiver<RuntimeEvent>) {
        let inner = self.lock_inner();
        let snap = inner.scrollback.snapshot();
        let info = AttachInfo {
            scrollback: BASE64.encode(&snap.bytes),
            scrollback_truncated: snap.truncated,
            last_seq: snap.last_seq,
            cols: inner.cols,
            rows: inner.rows,
            child_pid: inner.child_pid,
            running: inner.running,
            exit_code: inner.exit_code,
            exit_signal: inner.exit_signal.clone(),
            screen: Some(inner.screen.snapshot(inner.running)),
        };
        let rx = self.events.subscribe();
        drop(inner);
        (info, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn info(&self) -> WorkerSessionInfo {
        let inner = self.lock_inner();
        WorkerSessionInfo {
            session_id: self.session_id.clone(),
            running: inner.running,
            child_pid: inner.child_pid,
            cols: inner.cols,
            rows: inner.rows,
            exit_code: inner.exit_code,
            exit_signal: inner.exit_signal.clone(),
            last_seq: inner.scrollback.last_seq(),
            attached_subscribers: self.events.receiver_count(),
        }
    }
}

fn spawn_reader_thread(
    session_id: String,
    agent: AgentKind,
    mut reader: Box<dyn Read + Send>,
    inner: Arc<Mutex<RuntimeInner>>,
    events: broadcast::Sender<RuntimeEvent>,
    capture_path: Option<PathBuf>,
) {
    let spawn_result = std::thread::Builder::new()
        .name(format!("pty-read-{session_id}"))
        .spawn(move || {
            let mut capture = capture_path.as_deref().map(CaptureFile::open);
            let mut last_hint: Option<SessionState> = None;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(event = "daemon.runtime.reader_eof", session_id = %session_id);
                        break;
                    }
                    Ok(n) => {
                        let chunk = &buf[..n];
                        {
                            let mut guard = match inner.lock() {
                                Ok(g) => g,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            let seq = guard.scrollback.push(chunk);
                            guard.screen.process(chunk);
                            // Published under the lock: attach snapshots
                            // cannot interleave between push and send.
                            let _ = events.send(RuntimeEvent::Output {
                                seq,
                                bytes: chunk.to_vec(),
                            });
                        }
                        if let Some(capture) = capture.as_mut().and_then(|c| c.as_mut()) {
                            capture.append(chunk);
                        }
                        let text = String::from_utf8_lossy(chunk);
                        if let Some(hint) = attn_core::heuristics::scan_chunk(agent, &text)
                            && last_hint != Some(hint)
                        {
                            last_hint = Some(hint);
                            let _ = events.send(RuntimeEvent::Hint(hint));
                        }
                    }
                    Err(e) => {
                        error!(
                            event = "daemon.runtime.reader_error",
                            session_id = %session_id,
                            error = %e,
                        );
                        break;
                    }
                }
            }

            // Child is gone (or the PTY broke); record the exit under the
            // lock, then notify.
            let (exit_code, exit_signal) = {
                let mut guard = match inner.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.running = false;
                let code = match guard.child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        warn!(
                            event = "daemon.runtime.wait_failed",
                            session_id = %session_id,
                            error = %e,
                        );
                        None
                    }
                };
                guard.exit_code = code;
                (code, guard.exit_signal.clone())
            };
            info!(
                event = "daemon.runtime.child_exited",
                session_id = %session_id,
                exit_code = ?exit_code,
            );
            let _ = events.send(RuntimeEvent::Exit {
                exit_code,
                signal: exit_signal,
            });
        });
    if let Err(e) = spawn_result {
        error!(event = "daemon.runtime.reader_spawn_failed", error = %e);
    }
}

/// Rolling debug capture: restarted once the file exceeds the cap.
struct CaptureFile {
    path: PathBuf,
    file: std::fs::File,
    written: u64,
}

impl CaptureFile {
    fn open(path: &Path) -> Option<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let written = file.metadata().map(|m| m.len()).unwrap_or(0);
                Some(Self {
                    path: path.to_path_buf(),
                    file,
                    written,
                })
            }
            Err(e) => {
                warn!(
                    event = "daemon.runtime.capture_open_failed",
                    path = %path.display(),
                    error = %e,
                );
                None
            }
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        if self.written > CAPTURE_ROTATE_BYTES {
            if let Ok(file) = std::fs::File::create(&self.path) {
                self.file = file;
                self.written = 0;
            }
        }
        if self.file.write_all(chunk).is_ok() {
            self.written += chunk.len() as u64;
        }
    }
}

/// Map a signal name to a deliverable signal.
pub fn signal_by_name(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    match name.trim_start_matches("SIG").to_uppercase().as_str() {
        "TERM" => Some(Signal::SIGTERM),
        "KILL" => Some(Signal::SIGKILL),
        "INT" => Some(Signal::SIGINT),
        "HUP" => Some(Signal::SIGHUP),
        "QUIT" => Some(Signal::SIGQUIT),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}
