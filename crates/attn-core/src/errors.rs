use std::path::PathBuf;

/// Errors from the session state engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid session id: {0}")]
    InvalidId(String),

    #[error("unknown agent kind: {0}")]
    UnknownAgent(String),

    #[error("store error: {0}")]
    Store(#[from] attn_store::StoreError),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "session_not_found",
            SessionError::AlreadyExists(_) => "session_already_exists",
            SessionError::InvalidId(_) => "bad_request",
            SessionError::UnknownAgent(_) => "bad_request",
            SessionError::Store(_) => "store_error",
        }
    }
}

/// Errors from the classifier pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("transcript not found for session {session_id}")]
    TranscriptMissing { session_id: String },

    #[error("no assistant message after the last user turn in {path}")]
    NoAssistantMessage { path: PathBuf },

    #[error("classifier executable not found: {0}")]
    ExecutableMissing(String),

    #[error("all classifier model candidates unavailable")]
    AllModelsUnavailable,

    #[error("classifier output could not be parsed")]
    Unparseable { dump: String },

    #[error("classifier subprocess failed: {0}")]
    Subprocess(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ClassifierError::TranscriptMissing { .. } => "classifier_transcript_missing",
            ClassifierError::NoAssistantMessage { .. } => "classifier_no_message",
            ClassifierError::ExecutableMissing(_) => "classifier_executable_missing",
            ClassifierError::AllModelsUnavailable => "classifier_models_unavailable",
            ClassifierError::Unparseable { .. } => "classifier_unparsed",
            ClassifierError::Subprocess(_) => "classifier_subprocess_failed",
            ClassifierError::Io(_) => "io_error",
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            SessionError::NotFound("x".to_string()).error_code(),
            "session_not_found"
        );
        assert_eq!(
            SessionError::AlreadyExists("x".to_string()).error_code(),
            "session_already_exists"
        );
        assert_eq!(
            SessionError::UnknownAgent("gemini".to_string()).error_code(),
            "bad_request"
        );
    }

    #[test]
    fn test_classifier_unparsed_code() {
        let err = ClassifierError::Unparseable {
            dump: "garbled".to_string(),
        };
        assert_eq!(err.error_code(), "classifier_unparsed");
    }
}
