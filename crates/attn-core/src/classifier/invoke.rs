//! Classifier subprocess invocation.
//!
//! Claude and Codex sessions classify through the Claude CLI with a small
//! fast model; Copilot sessions use the Copilot CLI. Every invocation
//! runs in a private temporary cwd so it cannot pollute cwd-based
//! transcript discovery, with user setting sources disabled and all tools
//! denied.

use std::process::Stdio;
use std::time::Duration;

use attn_protocol::types::AgentKind;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::DaemonConfig;
use crate::errors::ClassifierError;

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Copilot takes the prompt as an argument; cap it well under ARG_MAX.
const COPILOT_PROMPT_CAP: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Waiting,
    Done,
}

const PROMPT_HEADER: &str = "You are labeling the final assistant message of a coding-agent \
turn. Reply with exactly one word: WAITING if the message asks the user a question or needs \
a decision before work can continue, DONE if the turn is complete and nothing is needed from \
the user. Do not explain.\n\nMessage:\n";

fn build_prompt(message: &str) -> String {
    format!("{PROMPT_HEADER}{message}")
}

/// Run the classifier for one assistant message, returning raw output.
pub async fn classify_message(
    agent: AgentKind,
    message: &str,
    config: &DaemonConfig,
) -> Result<String, ClassifierError> {
    match agent {
        AgentKind::Claude | AgentKind::Codex => run_claude(message, config).await,
        AgentKind::Copilot => run_copilot(message, config).await,
        AgentKind::Shell => Err(ClassifierError::Subprocess(
            "shell sessions are not classified".to_string(),
        )),
    }
}

async fn run_claude(message: &str, config: &DaemonConfig) -> Result<String, ClassifierError> {
    let exe = config
        .claude_executable
        .clone()
        .unwrap_or_else(|| "claude".to_string());
    let prompt = build_prompt(message);

    for model in &config.classifier_model_candidates {
        // Private cwd per invocation: no project settings, no transcript
        // pollution under the session's own working directory.
        let tmp = tempfile::tempdir()?;
        let mut child = tokio::process::Command::new(&exe)
            .args([
                "-p",
                "--model",
                model,
                "--max-turns",
                "1",
                "--setting-sources",
                "none",
                "--disallowedTools",
                "*",
            ])
            .current_dir(tmp.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClassifierError::ExecutableMissing(exe.clone()),
                _ => ClassifierError::Subprocess(e.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(CLASSIFY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ClassifierError::Subprocess("classifier timed out".to_string()))??;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(stdout);
        }
        if is_model_unavailable(&stdout, &stderr) {
            debug!(
                event = "core.classifier.model_unavailable",
                model = model.as_str(),
            );
            continue;
        }
        warn!(
            event = "core.classifier.claude_failed",
            model = model.as_str(),
            status = ?output.status.code(),
            stderr = %stderr.chars().take(500).collect::<String>(),
        );
        return Err(ClassifierError::Subprocess(format!(
            "claude exited with {}: {stderr}",
            output.status
        )));
    }
    Err(ClassifierError::AllModelsUnavailable)
}

async fn run_copilot(message: &str, config: &DaemonConfig) -> Result<String, ClassifierError> {
    let exe = config
        .copilot_executable
        .clone()
        .unwrap_or_else(|| "copilot".to_string());
    let mut prompt = build_prompt(message);
    prompt.truncate(COPILOT_PROMPT_CAP);

    let tmp = tempfile::tempdir()?;
    let child = tokio::process::Command::new(&exe)
        .args(["-p", &prompt, "--no-color"])
        .current_dir(tmp.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ClassifierError::ExecutableMissing(exe.clone()),
            _ => ClassifierError::Subprocess(e.to_string()),
        })?;

    let output = tokio::time::timeout(CLASSIFY_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ClassifierError::Subprocess("classifier timed out".to_string()))??;

    if !output.status.success() {
        return Err(ClassifierError::Subprocess(format!(
            "copilot exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn is_model_unavailable(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    combined.contains("model")
        && (combined.contains("not found")
            || combined.contains("not_found")
            || combined.contains("unavailable"))
}

/// Parse a structured verdict from classifier output.
///
/// Accepts a bare `WAITING`/`DONE` token (the last one wins, so a
/// rationale before the verdict is harmless) or a JSON object with a
/// `verdict` field. Returns `None` when no verdict can be decoded.
pub fn parse_verdict(raw: &str) -> Option<Verdict> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        // Claude's JSON output mode wraps the text in `result`.
        if let Some(inner) = value.get("result").and_then(|r| r.as_str()) {
            return parse_verdict(inner);
        }
        if let Some(verdict) = value.get("verdict").and_then(|v| v.as_str()) {
            return match verdict.to_uppercase().as_str() {
                "WAITING" => Some(Verdict::Waiting),
                "DONE" => Some(Verdict::Done),
                _ => None,
            };
        }
    }

    last_word_token(trimmed)
}

fn last_word_token(text: &str) -> Option<Verdict> {
    let mut found = None;
    for (pos, token, verdict) in [("WAITING", Verdict::Waiting), ("DONE", Verdict::Done)]
        .iter()
        .flat_map(|(token, verdict)| {
            text.match_indices(token)
                .map(move |(pos, _)| (pos, *token, *verdict))
        })
    {
        let before_ok = pos == 0
            || !text[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        let after = pos + token.len();
        let after_ok = after >= text.len()
            || !text[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        if before_ok && after_ok && found.is_none_or(|(p, _)| pos > p) {
            found = Some((pos, verdict));
        }
    }
    found.map(|(_, verdict)| verdict)
}
