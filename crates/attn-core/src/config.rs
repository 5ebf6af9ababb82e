//! Daemon configuration.
//!
//! Read from the `[daemon]` section of `~/.attn/config.toml`, then
//! overridden by `ATTN_*` environment variables. Every option has a
//! serde default so a missing file or section yields a working config.

use std::path::PathBuf;

use attn_paths::AttnPaths;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// PTY backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyBackendKind {
    /// One reconnectable sidecar process per session (default).
    Worker,
    /// PTYs in the daemon process; sessions die with the daemon.
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the control socket.
    /// Default: `<data_root>/attn.sock`
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// WebSocket listen port on 127.0.0.1.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_pty_backend")]
    pub pty_backend: PtyBackendKind,

    /// Advertised wire protocol version. Overriding is only useful for
    /// client compatibility testing.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Per-session scrollback ring size in bytes. Default: 8 MiB.
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,

    /// Per-client outbound queue depth before eviction.
    #[serde(default = "default_subscriber_buffer_messages")]
    pub subscriber_buffer_messages: usize,

    #[serde(default = "default_health_poll_interval_seconds")]
    pub health_poll_interval_seconds: u64,

    /// How long a session may stay unreachable before a synthesized exit.
    #[serde(default = "default_worker_unreachable_timeout_seconds")]
    pub worker_unreachable_timeout_seconds: u64,

    #[serde(default = "default_rpc_default_timeout_ms")]
    pub rpc_default_timeout_ms: u64,

    #[serde(default = "default_rpc_liveness_timeout_ms")]
    pub rpc_liveness_timeout_ms: u64,

    #[serde(default = "default_rpc_reclaim_timeout_ms")]
    pub rpc_reclaim_timeout_ms: u64,

    /// Upper bound on the recovery barrier; reconciliation continues in
    /// the background after it expires.
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,

    /// Classifier models, tried in order.
    #[serde(default = "default_classifier_model_candidates")]
    pub classifier_model_candidates: Vec<String>,

    /// Append raw PTY output to rolling capture files.
    #[serde(default)]
    pub debug_capture_enabled: bool,

    #[serde(default)]
    pub claude_executable: Option<String>,

    #[serde(default)]
    pub codex_executable: Option<String>,

    #[serde(default)]
    pub copilot_executable: Option<String>,
}

fn default_port() -> u16 {
    7821
}

fn default_pty_backend() -> PtyBackendKind {
    PtyBackendKind::Worker
}

fn default_protocol_version() -> String {
    attn_protocol::PROTOCOL_VERSION.to_string()
}

fn default_scrollback_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_subscriber_buffer_messages() -> usize {
    256
}

fn default_health_poll_interval_seconds() -> u64 {
    5
}

fn default_worker_unreachable_timeout_seconds() -> u64 {
    30
}

fn default_rpc_default_timeout_ms() -> u64 {
    5_000
}

fn default_rpc_liveness_timeout_ms() -> u64 {
    2_000
}

fn default_rpc_reclaim_timeout_ms() -> u64 {
    3_000
}

fn default_recovery_timeout_seconds() -> u64 {
    15
}

fn default_classifier_model_candidates() -> Vec<String> {
    vec![
        "claude-3-5-haiku-latest".to_string(),
        "claude-haiku-4-5".to_string(),
    ]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            port: default_port(),
            pty_backend: default_pty_backend(),
            protocol_version: default_protocol_version(),
            scrollback_bytes: default_scrollback_bytes(),
            subscriber_buffer_messages: default_subscriber_buffer_messages(),
            health_poll_interval_seconds: default_health_poll_interval_seconds(),
            worker_unreachable_timeout_seconds: default_worker_unreachable_timeout_seconds(),
            rpc_default_timeout_ms: default_rpc_default_timeout_ms(),
            rpc_liveness_timeout_ms: default_rpc_liveness_timeout_ms(),
            rpc_reclaim_timeout_ms: default_rpc_reclaim_timeout_ms(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            classifier_model_candidates: default_classifier_model_candidates(),
            debug_capture_enabled: false,
            claude_executable: None,
            codex_executable: None,
            copilot_executable: None,
        }
    }
}

impl DaemonConfig {
    /// Resolve the control socket path, deriving the default from the
    /// data root when not configured.
    pub fn socket_path(&self, paths: &AttnPaths) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| paths.control_socket())
    }

    /// Validate configuration values. Called after loading to catch
    /// misconfiguration early.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrollback_bytes < 4_096 {
            return Err(ConfigError::Invalid(
                "scrollback_bytes must be >= 4096".to_string(),
            ));
        }
        if self.scrollback_bytes > 256 * 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "scrollback_bytes must be <= 268435456 (256 MiB)".to_string(),
            ));
        }
        if self.subscriber_buffer_messages < 16 {
            return Err(ConfigError::Invalid(
                "subscriber_buffer_messages must be >= 16".to_string(),
            ));
        }
        if self.health_poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "health_poll_interval_seconds must be > 0".to_string(),
            ));
        }
        if self.worker_unreachable_timeout_seconds < self.health_poll_interval_seconds {
            return Err(ConfigError::Invalid(
                "worker_unreachable_timeout_seconds must be >= health_poll_interval_seconds"
                    .to_string(),
            ));
        }
        if self.rpc_default_timeout_ms == 0
            || self.rpc_liveness_timeout_ms == 0
            || self.rpc_reclaim_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "rpc timeouts must be > 0".to_string(),
            ));
        }
        if self.classifier_model_candidates.is_empty() {
            return Err(ConfigError::Invalid(
                "classifier_model_candidates must not be empty".to_string(),
            ));
        }
        if self.protocol_version.parse::<u32>().is_err() {
            return Err(ConfigError::Invalid(
                "protocol_version must be an integer string".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `ATTN_*` environment overrides on top of the file config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("ATTN_SOCKET_PATH") {
            self.socket_path = Some(PathBuf::from(path));
        }
        match std::env::var("ATTN_PTY_BACKEND").ok().as_deref() {
            Some("embedded") => self.pty_backend = PtyBackendKind::Embedded,
            Some("worker") => self.pty_backend = PtyBackendKind::Worker,
            Some(other) => {
                tracing::warn!(
                    event = "core.config.unknown_pty_backend",
                    value = other,
                );
            }
            None => {}
        }
        if let Ok(exe) = std::env::var("ATTN_CLAUDE_EXECUTABLE") {
            self.claude_executable = Some(exe);
        }
        if let Ok(exe) = std::env::var("ATTN_CODEX_EXECUTABLE") {
            self.codex_executable = Some(exe);
        }
        if let Ok(exe) = std::env::var("ATTN_COPILOT_EXECUTABLE") {
            self.copilot_executable = Some(exe);
        }
    }
}

/// Wrapper for deserializing the `[daemon]` section of the config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

/// Load daemon configuration from `<data_root>/config.toml` plus
/// environment overrides. Falls back to defaults when the file is missing
/// or malformed.
pub fn load_daemon_config(paths: &AttnPaths) -> Result<DaemonConfig, ConfigError> {
    let config_path = paths.user_config();
    let mut config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "core.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "core.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 7821);
        assert_eq!(config.pty_backend, PtyBackendKind::Worker);
        assert_eq!(config.protocol_version, attn_protocol::PROTOCOL_VERSION);
        assert_eq!(config.scrollback_bytes, 8 * 1024 * 1024);
        assert_eq!(config.subscriber_buffer_messages, 256);
        assert_eq!(config.health_poll_interval_seconds, 5);
        assert_eq!(config.worker_unreachable_timeout_seconds, 30);
        assert_eq!(config.rpc_default_timeout_ms, 5_000);
        assert_eq!(config.rpc_liveness_timeout_ms, 2_000);
        assert_eq!(config.rpc_reclaim_timeout_ms, 3_000);
        assert!(!config.debug_capture_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_section_parse() {
        let toml = r#"
[daemon]
port = 9000
pty_backend = "embedded"
scrollback_bytes = 65536
classifier_model_candidates = ["m1", "m2"]
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.daemon.port, 9000);
        assert_eq!(file.daemon.pty_backend, PtyBackendKind::Embedded);
        assert_eq!(file.daemon.scrollback_bytes, 65536);
        assert_eq!(file.daemon.classifier_model_candidates, vec!["m1", "m2"]);
        // Defaults for unset fields.
        assert_eq!(file.daemon.subscriber_buffer_messages, 256);
    }

    #[test]
    fn test_missing_section_gets_defaults() {
        let file: ConfigFile = toml::from_str("[other]\nx = 1\n").unwrap();
        assert_eq!(file.daemon.port, 7821);
    }

    #[test]
    fn test_validate_rejects_tiny_scrollback() {
        let config = DaemonConfig {
            scrollback_bytes: 16,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unreachable_below_poll() {
        let config = DaemonConfig {
            health_poll_interval_seconds: 10,
            worker_unreachable_timeout_seconds: 5,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_integer_protocol_version() {
        let config = DaemonConfig {
            protocol_version: "3.1".to_string(),
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_models() {
        let config = DaemonConfig {
            classifier_model_candidates: vec![],
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_backend() {
        temp_env::with_var("ATTN_PTY_BACKEND", Some("embedded"), || {
            let mut config = DaemonConfig::default();
            config.apply_env_overrides();
            assert_eq!(config.pty_backend, PtyBackendKind::Embedded);
        });
    }

    #[test]
    fn test_env_override_socket_and_executables() {
        temp_env::with_vars(
            [
                ("ATTN_SOCKET_PATH", Some("/tmp/custom.sock")),
                ("ATTN_CLAUDE_EXECUTABLE", Some("/opt/claude")),
            ],
            || {
                let mut config = DaemonConfig::default();
                config.apply_env_overrides();
                assert_eq!(
                    config.socket_path.as_deref(),
                    Some(std::path::Path::new("/tmp/custom.sock"))
                );
                assert_eq!(config.claude_executable.as_deref(), Some("/opt/claude"));
            },
        );
    }

    #[test]
    fn test_socket_path_default_derivation() {
        let config = DaemonConfig::default();
        let paths = AttnPaths::from_dir(PathBuf::from("/home/user/.attn"));
        assert_eq!(
            config.socket_path(&paths),
            PathBuf::from("/home/user/.attn/attn.sock")
        );
    }
}
