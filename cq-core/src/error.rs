use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be decoded. `raw` is the untouched stored text.
    #[error("corrupt entry for {key}: {reason}")]
    CorruptEntry {
        key: String,
        raw: String,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("follow-up scheduling failed: {0}")]
    Scheduler(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for QueueError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Outcome reported by the flush callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("retryable processing failure: {0}")]
    Retryable(String),

    #[error("fatal processing failure: {0}")]
    Fatal(String),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
