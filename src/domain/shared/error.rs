//! Call core errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation called from a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session is already past Idle
    #[error("Already in call: {0}")]
    AlreadyInCall(String),

    /// Another non-terminal session holds the process-wide slot
    #[error("Busy: call {0} is in progress")]
    Busy(String),

    /// The session has been ended; its async result was discarded
    #[error("Session ended: {0}")]
    SessionEnded(String),

    /// The peer link was closed while the operation was in flight
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Camera or microphone could not be acquired
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// SDP rejected, ICE failed, codec mismatch
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Call blocked: {0}")]
    CallBlocked(String),

    #[error("Unknown call: {0}")]
    UnknownCall(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallError {
    /// Precondition violations are programming errors and are never retried
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CallError::InvalidState(_) | CallError::AlreadyInCall(_) | CallError::InvalidArgument(_)
        )
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Codec(err.to_string())
    }
}

impl From<config::ConfigError> for CallError {
    fn from(err: config::ConfigError) -> Self {
        CallError::Config(err.to_string())
    }
}
