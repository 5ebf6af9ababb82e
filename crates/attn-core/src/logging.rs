//! Logging initialization for the CLI and the daemon.
//!
//! The `DEBUG` environment variable (`debug` or `trace`) raises verbosity
//! for both entry points; `RUST_LOG` still wins when set explicitly.

use std::path::Path;

use tracing_subscriber::EnvFilter;

fn base_filter(default_level: &str) -> EnvFilter {
    let level = match std::env::var("DEBUG").ok().as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        _ => default_level,
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize logging for CLI commands.
///
/// Quiet mode (the default) suppresses everything below warnings so
/// command output stays clean; `--verbose` restores info-level JSON logs.
pub fn init_cli_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(base_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging for the daemon: JSON lines appended to
/// `data_root/daemon.log`.
///
/// Falls back to stderr if the log file cannot be opened, so startup
/// failures remain observable.
pub fn init_daemon_logging(log_path: &Path) {
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(base_filter("info"))
                .with_writer(std::sync::Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(base_filter("info"))
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!(
                event = "core.logging.log_file_open_failed",
                path = %log_path.display(),
                error = %e,
            );
        }
    }
}
