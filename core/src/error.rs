use thiserror::Error;

/// Errors surfaced across the tool boundary. Every variant is folded into a
/// failure result payload; none of them abort the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error("no running session with ID {session_id}")]
    NoActiveSession { session_id: String },

    #[error("no finished session with ID {session_id}")]
    NoFinishedSession { session_id: String },

    #[error("no session (running or finished) with ID {session_id}")]
    NoSession { session_id: String },

    #[error("{0}")]
    StateConflict(String),

    #[error("failed to write to stdin: {0}")]
    Stdin(String),

    #[error("failed to spawn {shell}: {message}")]
    Spawn { shell: String, message: String },
}

impl SessionError {
    pub(crate) fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub(crate) fn state_conflict(message: impl Into<String>) -> Self {
        Self::StateConflict(message.into())
    }
}
