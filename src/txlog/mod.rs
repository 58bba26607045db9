//! Durable transaction log.
//!
//! One record per xid, written before the coordinator acknowledges any state
//! change. The active table is rebuilt from here after a restart, so the log
//! is the authority on where every transaction stands.
//!
//! Two backends:
//! - [`GitTransactionLog`]: records are documents in the `xa_transactions`
//!   collection; every append and update is a commit, and the commit history
//!   doubles as the audit trail.
//! - [`MemoryTransactionLog`]: in-process, with switchable write failures
//!   for exercising the coordinator's error paths.

mod error;
mod git;
mod memory;
mod record;

pub use error::{LogError, LogResult};
pub use git::GitTransactionLog;
pub use memory::MemoryTransactionLog;
pub use record::{unix_now, InvalidTransition, TransactionRecord, TransactionStatus};

/// Storage behind the coordinator's transaction records.
///
/// Implementations must be safe to call from many threads; each call is
/// atomic with respect to the single record it touches.
pub trait TransactionLog: Send + Sync {
    /// Persist a new record. Fails with `Duplicate` if the xid is known.
    fn append(&self, record: &TransactionRecord) -> LogResult<()>;

    /// Move an existing record to `status`, refreshing its update time.
    ///
    /// Refuses transitions the state machine does not allow and returns the
    /// record as stored afterwards.
    fn update(&self, xid: &str, status: TransactionStatus) -> LogResult<TransactionRecord>;

    fn get(&self, xid: &str) -> LogResult<Option<TransactionRecord>>;

    /// All records not yet in a terminal status, oldest first.
    fn scan_pending(&self) -> LogResult<Vec<TransactionRecord>>;

    /// Delete terminal records last updated strictly before `before`
    /// (unix seconds). Returns how many were removed.
    fn purge(&self, before: u64) -> LogResult<usize>;
}

/// Oldest first, xid as tie-breaker.
pub(crate) fn sort_records(records: &mut [TransactionRecord]) {
    records.sort_by(|a, b| {
        a.create_time
            .cmp(&b.create_time)
            .then_with(|| a.xid.cmp(&b.xid))
    });
}
