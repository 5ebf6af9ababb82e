//! End-of-turn classifier pipeline.
//!
//! Two independent triggers feed this pipeline per assistant turn: the
//! hook's explicit `stop` event and the transcript quiet-window watcher.
//! Triggers keyed by `(session_id, turn_uuid)` coalesce to one classifier
//! invocation; verdicts commit through the engine's timestamp guard with
//! the trigger time, so a user action after the trigger always wins.

mod invoke;

pub use invoke::{Verdict, parse_verdict};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use attn_protocol::types::{AgentKind, SessionState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::errors::ClassifierError;
use crate::sessions::SessionEngine;
use crate::transcripts;

/// How far a transcript message may predate the trigger and still count
/// as belonging to this turn. Anything older is a previous turn's tail.
const FRESHNESS_WINDOW_SECS: i64 = 300;

const READ_ATTEMPTS: u32 = 4;
const READ_RETRY_DELAY_MS: u64 = 250;

/// Where a classification request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    HookStop,
    QuietWindow,
}

pub struct ClassifierPipeline {
    engine: Arc<SessionEngine>,
    config: Arc<DaemonConfig>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the in-flight key when a classification finishes.
struct InFlightGuard<'a> {
    pipeline: &'a ClassifierPipeline,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.pipeline.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

impl ClassifierPipeline {
    pub fn new(engine: Arc<SessionEngine>, config: Arc<DaemonConfig>) -> Self {
        Self {
            engine,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Classify the end of a turn and commit the resulting state.
    ///
    /// `trigger_time` is the stop event's (or quiet window's) timestamp;
    /// it becomes the proposed `state_updated_at`, which is what makes a
    /// later user action immune to a slow classifier.
    pub async fn classify_end_of_turn(
        &self,
        session_id: &str,
        turn_uuid: Option<&str>,
        transcript_path: Option<&Path>,
        trigger_time: DateTime<Utc>,
        source: TriggerSource,
    ) {
        let Some(session) = self.engine.get(session_id) else {
            debug!(
                event = "core.classifier.unknown_session",
                session_id = session_id,
            );
            return;
        };
        if session.agent == AgentKind::Shell {
            return;
        }

        // Duplicate stop events for an already-classified turn short-circuit.
        if let Some(uuid) = turn_uuid
            && session.agent == AgentKind::Claude
            && self.engine.already_classified(session_id, uuid)
        {
            debug!(
                event = "core.classifier.turn_already_classified",
                session_id = session_id,
                turn_uuid = uuid,
            );
            return;
        }

        // Concurrent triggers for the same turn coalesce.
        let key = format!("{session_id}\u{0}{}", turn_uuid.unwrap_or("tail"));
        {
            let Ok(mut set) = self.in_flight.lock() else {
                return;
            };
            if !set.insert(key.clone()) {
                debug!(
                    event = "core.classifier.trigger_coalesced",
                    session_id = session_id,
                    source = ?source,
                );
                return;
            }
        }
        let _guard = InFlightGuard {
            pipeline: self,
            key,
        };

        let path: Option<PathBuf> = transcript_path.map(Path::to_path_buf).or_else(|| {
            dirs::home_dir().and_then(|home| transcripts::locate_transcript(&home, &session))
        });
        let Some(path) = path else {
            warn!(
                event = "core.classifier.transcript_missing",
                session_id = session_id,
                agent = %session.agent,
            );
            return;
        };

        let message = match transcripts::last_assistant_message_with_retry(
            session.agent,
            &path,
            READ_ATTEMPTS,
            std::time::Duration::from_millis(READ_RETRY_DELAY_MS),
        )
        .await
        {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(
                    event = "core.classifier.no_assistant_message",
                    session_id = session_id,
                    path = %path.display(),
                );
                return;
            }
            Err(e) => {
                warn!(
                    event = "core.classifier.transcript_read_failed",
                    session_id = session_id,
                    path = %path.display(),
                    error = %e,
                );
                return;
            }
        };

        // Freshness guard: a message recorded long before the trigger is
        // a previous turn's tail, not this one's.
        if message.timestamp < trigger_time - ChronoDuration::seconds(FRESHNESS_WINDOW_SECS) {
            warn!(
                event = "core.classifier.stale_message_discarded",
                session_id = session_id,
                message_at = %message.timestamp,
                trigger_at = %trigger_time,
            );
            return;
        }

        let state = match invoke::classify_message(session.agent, &message.text, &self.config)
            .await
        {
            Ok(raw) => match invoke::parse_verdict(&raw) {
                Some(Verdict::Waiting) => SessionState::WaitingInput,
                Some(Verdict::Done) => SessionState::Idle,
                None => {
                    // Never silently map an unreadable verdict to
                    // waiting_input; surface the uncertainty instead.
                    error!(
                        event = "core.classifier.verdict_unparsed",
                        session_id = session_id,
                        output = %raw.chars().take(2000).collect::<String>(),
                    );
                    SessionState::Unknown
                }
            },
            Err(ClassifierError::AllModelsUnavailable) => {
                error!(
                    event = "core.classifier.models_unavailable",
                    session_id = session_id,
                );
                SessionState::Unknown
            }
            Err(e) => {
                error!(
                    event = "core.classifier.invoke_failed",
                    session_id = session_id,
                    error = %e,
                );
                SessionState::Unknown
            }
        };

        let committed = self
            .engine
            .update_state_if_newer(session_id, state, trigger_time);
        info!(
            event = "core.classifier.completed",
            session_id = session_id,
            state = %state,
            committed = committed,
            source = ?source,
        );
    }
}
