use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the lifecycle operations of the sync engine.
/// Sync passes themselves never fail their callers; they log and move on.
#[derive(Debug, Error)]
pub enum SessionSyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("session title must not be empty")]
    EmptyTitle,
    #[error("no active session")]
    NoActiveSession,
    /// An operation that needs a collaborator the engine was built without.
    #[error("{0} is not configured")]
    Uninitialized(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionSyncError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Transport(error) if error.is_authorization())
    }

    /// Map a transport not-found into `SessionNotFound` for `session_id`.
    pub(crate) fn from_lookup(session_id: &str, error: TransportError) -> Self {
        if error.is_not_found() {
            Self::SessionNotFound(session_id.to_string())
        } else {
            Self::Transport(error)
        }
    }
}

pub type SessionSyncResult<T> = Result<T, SessionSyncError>;
