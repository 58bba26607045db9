//! Coordinator error types.

use thiserror::Error;

use crate::resource::BranchError;
use crate::txlog::{InvalidTransition, LogError, TransactionStatus};

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors surfaced by the transaction coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A resource manager could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A resource manager refused a protocol call.
    #[error("protocol error on {xid}: {reason}")]
    Protocol { xid: String, reason: String },

    /// The xid is not known to the coordinator.
    #[error("transaction not found: {0}")]
    NotFound(String),

    /// The correlation id already has an active transaction.
    #[error("order {order_no} already has active transaction {xid}")]
    Duplicate { order_no: String, xid: String },

    /// The transaction log could not record a state change.
    #[error("transaction log failure: {0}")]
    Persistence(#[from] LogError),

    /// The requested status change is not allowed from the current status.
    #[error("transaction {xid} cannot move from {from} to {to}")]
    InvalidTransition {
        xid: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinatorError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Connection(_) => true,
            CoordinatorError::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn from_branch(xid: &str, err: BranchError) -> Self {
        match err {
            BranchError::Connection { .. } => CoordinatorError::Connection(err.to_string()),
            BranchError::NotFound(_) => CoordinatorError::NotFound(xid.to_string()),
            BranchError::Protocol { reason, .. } => CoordinatorError::Protocol {
                xid: xid.to_string(),
                reason,
            },
            other => CoordinatorError::Protocol {
                xid: xid.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<InvalidTransition> for CoordinatorError {
    fn from(err: InvalidTransition) -> Self {
        CoordinatorError::InvalidTransition {
            xid: err.xid,
            from: err.from,
            to: err.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_error_mapping() {
        let err = CoordinatorError::from_branch("TXN_1_a", BranchError::connection("orders", "down"));
        assert!(matches!(err, CoordinatorError::Connection(_)));
        assert!(err.is_retryable());

        let err = CoordinatorError::from_branch("TXN_1_a", BranchError::protocol("TXN_1_a", "no"));
        assert!(matches!(err, CoordinatorError::Protocol { ref reason, .. } if reason == "no"));

        let err = CoordinatorError::from_branch("TXN_1_a", BranchError::NotFound("x".into()));
        assert!(matches!(err, CoordinatorError::NotFound(ref xid) if xid == "TXN_1_a"));
    }

    #[test]
    fn test_persistence_retryable() {
        let err = CoordinatorError::from(LogError::Unavailable("down".into()));
        assert!(err.is_retryable());
        let err = CoordinatorError::from(LogError::Duplicate("TXN_1_a".into()));
        assert!(!err.is_retryable());
    }
}
