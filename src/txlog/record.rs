//! Transaction records and the status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a coordinated transaction.
///
/// ```text
/// INIT -> STARTED -> PREPARED -> COMMITTED
///            |           |----> ROLLED_BACK
///            |           \----> FAILED
///            |----------------> COMMITTED   (commit without prepare)
///            |----------------> ROLLED_BACK
///            \----------------> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    #[default]
    Init,
    Started,
    Prepared,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 6] = [
        TransactionStatus::Init,
        TransactionStatus::Started,
        TransactionStatus::Prepared,
        TransactionStatus::Committed,
        TransactionStatus::RolledBack,
        TransactionStatus::Failed,
    ];

    /// Terminal records never change again and may be purged.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Failed
        )
    }

    /// Whether a record in this status may move to `next`.
    ///
    /// `Started -> Committed` is allowed: a commit is accepted without a
    /// prior prepare.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Init, Started)
                | (Started, Prepared)
                | (Started, Committed)
                | (Started, RolledBack)
                | (Started, Failed)
                | (Prepared, Committed)
                | (Prepared, RolledBack)
                | (Prepared, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Init => "INIT",
            TransactionStatus::Started => "STARTED",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLED_BACK",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown transaction status: {}", s))
    }
}

/// A refused status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction {xid} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub xid: String,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// One coordinated transaction as persisted in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub xid: String,
    pub status: TransactionStatus,
    /// unix seconds
    pub create_time: u64,
    /// unix seconds
    pub update_time: u64,
    /// caller-supplied correlation id
    pub order_no: String,
    pub participants: Vec<String>,
}

impl TransactionRecord {
    /// A fresh record for a branch that has just begun.
    pub fn started(
        xid: impl Into<String>,
        order_no: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        let now = unix_now();
        Self {
            xid: xid.into(),
            status: TransactionStatus::Started,
            create_time: now,
            update_time: now,
            order_no: order_no.into(),
            participants,
        }
    }

    /// Copy of this record moved to `to`, stamped with `at`.
    pub fn advanced(&self, to: TransactionStatus, at: u64) -> Result<Self, InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                xid: self.xid.clone(),
                from: self.status,
                to,
            });
        }

        Ok(Self {
            status: to,
            update_time: at.max(self.update_time),
            ..self.clone()
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Current time in unix seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TransactionStatus::Init.is_terminal());
        assert!(!TransactionStatus::Started.is_terminal());
        assert!(!TransactionStatus::Prepared.is_terminal());
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_commit_without_prepare_is_allowed() {
        assert!(TransactionStatus::Started.can_transition_to(TransactionStatus::Committed));
    }

    #[test]
    fn test_no_transition_leaves_terminal() {
        for from in TransactionStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TransactionStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TransactionStatus::RolledBack.to_string(), "ROLLED_BACK");
        assert_eq!(
            "rolled_back".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::RolledBack
        );
        assert!("DONE".parse::<TransactionStatus>().is_err());

        let json = serde_json::to_string(&TransactionStatus::Prepared).unwrap();
        assert_eq!(json, "\"PREPARED\"");
    }

    #[test]
    fn test_advanced_keeps_create_time() {
        let record = TransactionRecord::started("TXN_1_a", "ORDER1", vec!["orders".into()]);
        let prepared = record
            .advanced(TransactionStatus::Prepared, record.create_time + 5)
            .unwrap();

        assert_eq!(prepared.status, TransactionStatus::Prepared);
        assert_eq!(prepared.create_time, record.create_time);
        assert_eq!(prepared.update_time, record.create_time + 5);

        let err = prepared.advanced(TransactionStatus::Started, 0).unwrap_err();
        assert_eq!(err.from, TransactionStatus::Prepared);
        assert_eq!(err.to, TransactionStatus::Started);
    }

    fn status_strategy() -> impl Strategy<Value = TransactionStatus> {
        prop::sample::select(TransactionStatus::ALL.to_vec())
    }

    proptest! {
        // Applying any sequence of requested statuses only ever moves forward.
        #[test]
        fn prop_status_never_regresses(requests in prop::collection::vec(status_strategy(), 0..16)) {
            let rank = |s: TransactionStatus| match s {
                TransactionStatus::Init => 0,
                TransactionStatus::Started => 1,
                TransactionStatus::Prepared => 2,
                _ => 3,
            };

            let mut record = TransactionRecord::started("TXN_1_a", "ORDER1", Vec::new());
            for (step, to) in requests.into_iter().enumerate() {
                let before = record.status;
                if let Ok(next) = record.advanced(to, step as u64) {
                    prop_assert!(rank(next.status) > rank(before));
                    prop_assert!(!before.is_terminal());
                    record = next;
                }
            }
        }
    }
}
