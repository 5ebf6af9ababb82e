//! Notification intents.
//!
//! The daemon decides *when* a session transition deserves the user's
//! attention; actual OS notification delivery belongs to the desktop UI.
//! Intents are logged so the UI (and tests) observe them through the
//! event stream and log.

use attn_protocol::types::{AgentKind, SessionState};
use tracing::info;

/// A transition deserves a notification when the session newly needs the
/// user (and notifications are enabled).
pub fn should_notify(
    notifications_enabled: bool,
    old_state: SessionState,
    new_state: SessionState,
) -> bool {
    notifications_enabled && new_state.needs_attention() && !old_state.needs_attention()
}

pub fn notification_message(agent: AgentKind, label: &str, state: SessionState) -> String {
    match state {
        SessionState::WaitingInput => format!("{agent} in {label} is waiting for your reply"),
        SessionState::PendingApproval => format!("{agent} in {label} needs approval"),
        other => format!("{agent} in {label} is {other}"),
    }
}

pub fn emit_notification_intent(agent: AgentKind, label: &str, state: SessionState) {
    info!(
        event = "core.notify.intent",
        agent = %agent,
        label = label,
        state = %state,
        message = %notification_message(agent, label, state),
    );
}
