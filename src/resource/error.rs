//! Resource manager error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

pub type BranchResult<T> = Result<T, BranchError>;

/// Failures reported by a resource manager or one of its branches.
#[derive(Debug, Error)]
pub enum BranchError {
    /// The resource manager could not be reached.
    #[error("resource manager {rm} unreachable: {reason}")]
    Connection { rm: String, reason: String },

    /// The resource manager refused an XA call in the branch's current state.
    #[error("protocol error on {xid}: {reason}")]
    Protocol { xid: String, reason: String },

    /// The resource manager knows nothing about this xid.
    #[error("unknown transaction branch: {0}")]
    NotFound(String),

    /// Local writes collide with changes already committed or prepared.
    #[error("transaction {xid} conflicts on paths: {}", paths_display(.paths))]
    Conflict { xid: String, paths: Vec<PathBuf> },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

fn paths_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl BranchError {
    pub fn protocol(xid: impl Into<String>, reason: impl Into<String>) -> Self {
        BranchError::Protocol {
            xid: xid.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(rm: impl Into<String>, reason: impl Into<String>) -> Self {
        BranchError::Connection {
            rm: rm.into(),
            reason: reason.into(),
        }
    }

    /// The call may succeed once the resource manager is reachable again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BranchError::Connection { .. } => true,
            BranchError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = BranchError::Conflict {
            xid: "TXN_1_a".to_string(),
            paths: vec![PathBuf::from("orders/o1.json"), PathBuf::from("payments/p1.json")],
        };
        assert_eq!(
            err.to_string(),
            "transaction TXN_1_a conflicts on paths: orders/o1.json, payments/p1.json"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BranchError::connection("orders", "down").is_retryable());
        assert!(!BranchError::protocol("TXN_1_a", "rejected").is_retryable());
        assert!(!BranchError::NotFound("TXN_1_a".to_string()).is_retryable());
    }
}
