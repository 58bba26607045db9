//! Transaction log errors.

use thiserror::Error;

use crate::storage::StorageError;
use crate::txlog::record::InvalidTransition;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("transaction {0} is already logged")]
    Duplicate(String),

    #[error("transaction {0} is not in the log")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("log storage error: {0}")]
    Storage(#[from] StorageError),

    /// the log refused the write; nothing was persisted
    #[error("transaction log unavailable: {0}")]
    Unavailable(String),
}

impl LogError {
    /// A retry of the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LogError::Unavailable(_) => true,
            LogError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}

pub type LogResult<T> = Result<T, LogError>;
