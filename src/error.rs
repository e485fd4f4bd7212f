//! Error taxonomy shared by the sync controllers and their collaborators.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// No response from the server, or the connection dropped mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the session token. The session has already been
    /// torn down by the time a caller sees this.
    #[error("unauthorized")]
    Unauthorized,

    /// The server already applied this action (usually from another tab or
    /// device). Callers converge local state instead of surfacing it.
    #[error("request already processed: {0}")]
    AlreadyProcessed(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("event bus error: {0}")]
    Bus(String),

    #[error("cannot {action} while friendship is {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("controller closed")]
    Closed,
}

impl SyncError {
    /// Business-rule conflicts that mean "the server is already where we
    /// wanted it to be".
    pub fn is_benign_race(&self) -> bool {
        matches!(self, SyncError::AlreadyProcessed(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
