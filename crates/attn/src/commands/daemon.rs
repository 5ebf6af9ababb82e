use std::time::{Duration, Instant};

use attn_paths::AttnPaths;
use attn_protocol::client::send_to_daemon;
use attn_protocol::hook::HookMessage;
use clap::ArgMatches;
use tracing::{debug, error, info};

pub(crate) fn handle_daemon_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        Some(("start", sub)) => handle_daemon_start(sub),
        Some(("stop", _)) => handle_daemon_stop(),
        Some(("status", _)) => handle_daemon_status(),
        _ => Err("unknown daemon subcommand".into()),
    }
}

fn socket_path() -> Result<std::path::PathBuf, Box<dyn std::error::Error>> {
    let paths = AttnPaths::resolve()?;
    let config = attn_core::load_daemon_config(&paths)?;
    Ok(config.socket_path(&paths))
}

fn daemon_is_running() -> bool {
    socket_path()
        .ok()
        .and_then(|path| send_to_daemon(&path, &HookMessage::Status).ok())
        .is_some()
}

fn handle_daemon_start(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let foreground = matches.get_flag("foreground");
    info!(event = "cli.daemon.start_started", foreground = foreground);

    if daemon_is_running() {
        println!("Daemon already running");
        return Ok(());
    }

    if foreground {
        let paths = AttnPaths::resolve()?;
        attn_core::init_daemon_logging(&paths.daemon_log_file());
        let config = attn_core::load_daemon_config(&paths)?;
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(attn_daemon::run_server(paths, config))?;
        info!(event = "cli.daemon.start_completed");
        return Ok(());
    }

    // Detached: re-exec ourselves in foreground mode and wait for the
    // control socket, watching for an early crash.
    let exe = std::env::current_exe()?;
    let mut child = std::process::Command::new(&exe)
        .args(["daemon", "start", "--foreground"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to start daemon: {e}"))?;

    debug!(event = "cli.daemon.spawn_completed", pid = child.id());

    let start = Instant::now();
    let timeout = Duration::from_secs(10);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                error!(event = "cli.daemon.start_failed", status = %status);
                return Err(format!(
                    "daemon exited with {status} before becoming ready.\n\
                     Try: attn daemon start --foreground  (to see startup errors)"
                )
                .into());
            }
            Ok(None) => {}
            Err(e) => {
                debug!(event = "cli.daemon.child_status_check_failed", error = %e);
            }
        }

        if daemon_is_running() {
            println!("Daemon started (PID: {})", child.id());
            info!(event = "cli.daemon.start_completed", pid = child.id());
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err("daemon did not become ready within 10s".into());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn handle_daemon_stop() -> Result<(), Box<dyn std::error::Error>> {
    let paths = AttnPaths::resolve()?;
    let pid_path = paths.daemon_pid_file();
    let Some(pid) = attn_daemon::pid::read_pid_file(&pid_path) else {
        println!("Daemon is not running");
        return Ok(());
    };
    if !attn_daemon::pid::is_process_alive(pid) {
        println!("Daemon is not running (stale PID file)");
        return Ok(());
    }

    info!(event = "cli.daemon.stop_started", pid = pid);
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .map_err(|e| format!("failed to signal daemon (pid {pid}): {e}"))?;

    // Wait for orderly shutdown.
    let start = Instant::now();
    while attn_daemon::pid::is_process_alive(pid) {
        if start.elapsed() > Duration::from_secs(10) {
            return Err(format!("daemon (pid {pid}) did not exit within 10s").into());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    println!("Daemon stopped");
    info!(event = "cli.daemon.stop_completed", pid = pid);
    Ok(())
}

fn handle_daemon_status() -> Result<(), Box<dyn std::error::Error>> {
    let path = socket_path()?;
    match send_to_daemon(&path, &HookMessage::Status) {
        Ok(reply) => {
            let Some(status) = reply.status else {
                return Err("daemon returned no status".into());
            };
            println!("Daemon running");
            println!("  pid:              {}", status.pid);
            println!("  uptime:           {}s", status.uptime_secs);
            println!("  sessions:         {}", status.session_count);
            println!("  protocol version: {}", status.protocol_version);
            println!("  instance id:      {}", status.daemon_instance_id);
            if status.recovering {
                println!("  recovery:         in progress");
            }
            if status.degraded {
                println!("  storage:          DEGRADED (in-memory)");
            }
            Ok(())
        }
        Err(attn_protocol::IpcError::NotRunning { .. }) => {
            println!("Daemon is not running");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
