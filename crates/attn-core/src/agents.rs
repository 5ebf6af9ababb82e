//! Agent executable resolution and spawn helpers.

use std::path::PathBuf;

use attn_protocol::types::AgentKind;

use crate::config::DaemonConfig;

/// Resolve the executable for an agent kind.
///
/// Precedence: config override (already merged with `ATTN_*_EXECUTABLE`
/// environment variables), then `$PATH` lookup. Shell sessions have no
/// executable — the PTY runtime falls back to the user's default shell.
pub fn resolve_executable(agent: AgentKind, config: &DaemonConfig) -> Option<PathBuf> {
    let override_path = match agent {
        AgentKind::Claude => config.claude_executable.as_deref(),
        AgentKind::Codex => config.codex_executable.as_deref(),
        AgentKind::Copilot => config.copilot_executable.as_deref(),
        AgentKind::Shell => None,
    };
    if let Some(path) = override_path {
        return Some(PathBuf::from(path));
    }
    match agent {
        AgentKind::Shell => None,
        other => which::which(other.as_str()).ok(),
    }
}

/// Whether the agent's executable is present on this machine.
pub fn is_available(agent: AgentKind, config: &DaemonConfig) -> bool {
    match agent {
        AgentKind::Shell => true,
        other => resolve_executable(other, config).is_some(),
    }
}

/// Extra CLI args to resume an agent-native session.
///
/// Only Claude exposes a resume flag today; the other agents re-discover
/// context from their own session stores.
pub fn resume_args(agent: AgentKind, resume_session_id: &str) -> Vec<String> {
    match agent {
        AgentKind::Claude => vec!["--resume".to_string(), resume_session_id.to_string()],
        _ => vec![],
    }
}

/// Environment injected into agent subprocesses spawned by the daemon.
pub fn spawn_env(session_id: &str, wrapper_path: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![
        ("ATTN_SESSION_ID".to_string(), session_id.to_string()),
        ("ATTN_DAEMON_MANAGED".to_string(), "1".to_string()),
    ];
    if let Some(wrapper) = wrapper_path {
        env.push(("ATTN_WRAPPER_PATH".to_string(), wrapper.to_string()));
    }
    env
}
