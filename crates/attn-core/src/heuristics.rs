//! PTY-output heuristics.
//!
//! Terminal-output pattern scanning produces *hints*; the session engine
//! decides whether a hint may commit. Hints are scanned where PTY bytes
//! are read (worker process or embedded runtime) so they work for
//! unattached sessions too.

use attn_protocol::types::{AgentKind, SessionState};

/// Approval-prompt fragments per agent. Matching any of these while the
/// agent paints a prompt means the turn is blocked on permission.
const CLAUDE_APPROVAL: &[&str] = &[
    "Do you want to proceed",
    "Do you want to make this edit",
    "Do you want to allow",
    "\u{276f} 1. Yes",
];
const CODEX_APPROVAL: &[&str] = &["Allow command?", "requires approval", "(y/N)"];
const COPILOT_APPROVAL: &[&str] = &["Allow this tool", "Confirm tool use", "[y]es"];

/// Working-indicator fragments (spinners and interrupt hints).
const CLAUDE_WORKING: &[&str] = &["esc to interrupt", "Esc to interrupt"];
const CODEX_WORKING: &[&str] = &["Working\u{2026}", "\u{2022} Working"];
const COPILOT_WORKING: &[&str] = &["Thinking", "Running tool"];

/// Input-prompt fragments suggesting the agent is waiting on the user.
const CLAUDE_WAITING: &[&str] = &["\u{2502} > "];
const CODEX_WAITING: &[&str] = &["\u{276f} send a message"];

/// Scan one output chunk for a state hint. Later signals in the chunk win
/// so that the most recent paint decides. Approval beats working when both
/// appear at the same offset region, since approval prompts freeze output.
pub fn scan_chunk(agent: AgentKind, chunk: &str) -> Option<SessionState> {
    let (approval, working, waiting): (&[&str], &[&str], &[&str]) = match agent {
        AgentKind::Claude => (CLAUDE_APPROVAL, CLAUDE_WORKING, CLAUDE_WAITING),
        AgentKind::Codex => (CODEX_APPROVAL, CODEX_WORKING, CODEX_WAITING),
        AgentKind::Copilot => (COPILOT_APPROVAL, COPILOT_WORKING, &[]),
        AgentKind::Shell => return None,
    };

    let mut best: Option<(usize, SessionState)> = None;
    let mut consider = |patterns: &[&str], state: SessionState, tie_break: usize| {
        for pattern in patterns {
            if let Some(pos) = chunk.rfind(pattern) {
                let rank = (pos, tie_break);
                let current = best.map(|(p, s)| (p, rank_of(s)));
                if current.is_none_or(|(p, t)| rank > (p, t)) {
                    best = Some((pos, state));
                }
            }
        }
    };
    consider(working, SessionState::Working, 0);
    consider(waiting, SessionState::WaitingInput, 1);
    consider(approval, SessionState::PendingApproval, 2);
    best.map(|(_, state)| state)
}

fn rank_of(state: SessionState) -> usize {
    match state {
        SessionState::Working => 0,
        SessionState::WaitingInput => 1,
        SessionState::PendingApproval => 2,
        _ => 0,
    }
}

/// Admission rules for heuristic hints (enforced centrally by the engine):
///
/// - a hint equal to the current state is a no-op;
/// - while `pending_approval`, heuristic downgrades to `idle` or
///   `waiting_input` are suppressed — clearing requires a positive
///   transcript signal;
/// - for agents whose authoritative source is the transcript, only
///   `working` and `pending_approval` hints pass at all.
pub fn admit_heuristic(
    current: SessionState,
    agent: AgentKind,
    hint: SessionState,
) -> bool {
    if hint == current {
        return false;
    }
    let is_downgrade = matches!(hint, SessionState::Idle | SessionState::WaitingInput);
    if current == SessionState::PendingApproval && is_downgrade {
        return false;
    }
    if agent.transcript_authoritative() && is_downgrade {
        return false;
    }
    true
}
