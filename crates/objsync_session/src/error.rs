//! Error types for sync sessions.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can escape a sync session.
///
/// Errors reported by servers never surface here; they are routed through
/// the state machine and the session's error handler instead.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The operation is not valid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Credential bookkeeping failed.
    #[error(transparent)]
    Auth(#[from] objsync_auth::AuthError),

    /// The network executor could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}
