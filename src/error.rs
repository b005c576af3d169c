use thiserror::Error;

/// Errors surfaced by the conversation engine.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Self-chat or a malformed participant id. Rejected before any I/O.
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    /// Conversation create/repair failed. Callers retry; the engine does not.
    #[error("conversation initialization failed: {0}")]
    InitializationFailed(String),

    /// A storage operation exceeded its deadline.
    #[error("storage operation timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("empty message body")]
    EmptyMessage,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
