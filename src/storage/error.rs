//! Storage layer error types
//!
//! All errors that can occur during storage operations are defined here.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{CollectionName, DocumentKey, InvalidNameError};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("document not found: {collection}/{key}")]
    DocumentNotFound {
        collection: CollectionName,
        key: DocumentKey,
    },

    #[error("document already exists: {collection}/{key}")]
    DocumentAlreadyExists {
        collection: CollectionName,
        key: DocumentKey,
    },

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("unexpected entry type at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// branch update failed due to concurrent modification
    #[error("concurrent modification: branch {branch} was updated by another writer")]
    ConcurrentModification { branch: String },

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::DocumentNotFound { .. }
                | StorageError::RefNotFound(_)
                | StorageError::CommitNotFound(_)
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::DocumentAlreadyExists { .. }
                | StorageError::BranchAlreadyExists(_)
                | StorageError::ConcurrentModification { .. }
        )
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::DocumentNotFound {
            collection: CollectionName::new("orders").unwrap(),
            key: DocumentKey::new("o1").unwrap(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::ConcurrentModification {
            branch: "main".to_string(),
        };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());
        assert!(conflict.is_retriable());
    }
}
