//! attn-core: session state engine, classifier pipeline, and transcript
//! discovery for the attn daemon.
//!
//! # Main entry points
//!
//! - [`sessions`] - the session state engine and its monotonic update rules
//! - [`classifier`] - end-of-turn classification of assistant messages
//! - [`transcripts`] - per-agent transcript discovery and tail reading
//! - [`heuristics`] - PTY-output state hints and their admission rules
//! - [`config`] - daemon configuration loading and validation

pub mod agents;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod heuristics;
pub mod logging;
pub mod notify;
pub mod sessions;
pub mod transcripts;

pub use config::{DaemonConfig, PtyBackendKind, load_daemon_config};
pub use errors::{ClassifierError, ConfigError, SessionError};
pub use logging::{init_cli_logging, init_daemon_logging};
pub use sessions::{EngineEvent, Session, SessionEngine};
