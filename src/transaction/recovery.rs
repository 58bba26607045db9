//! Crash recovery.
//!
//! After a restart the active table is empty while the log may still hold
//! transactions that were started or prepared. Recovery reloads those
//! records as they stand; resolving them stays with the caller, who commits
//! or rolls back each xid through the coordinator.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::transaction::table::ActiveTransactionTable;
use crate::txlog::{LogResult, TransactionLog, TransactionRecord, TransactionStatus};

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// xids added to the active table, oldest first
    pub loaded: Vec<String>,
    /// pending records whose xid was already tracked
    pub already_active: usize,
    /// loaded records still in STARTED
    pub started: usize,
    /// loaded records in PREPARED
    pub prepared: usize,
}

/// A transaction prepared somewhere and awaiting a decision.
///
/// Either the log says PREPARED, or the log still says STARTED while the
/// resource manager already holds the branch prepared (a crash between the
/// participant's vote and the log write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubtTransaction {
    pub record: TransactionRecord,
    /// whether the resource manager still reports the xid as prepared
    pub participant_prepared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InDoubtReport {
    pub transactions: Vec<InDoubtTransaction>,
    /// xids the resource manager holds prepared with no pending log record
    pub orphaned: Vec<String>,
}

impl InDoubtReport {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.orphaned.is_empty()
    }

    /// Match pending log records against the resource manager's prepared
    /// xids.
    pub fn classify(pending: Vec<TransactionRecord>, rm_prepared: Vec<String>) -> Self {
        let mut rm_prepared: BTreeSet<String> = rm_prepared.into_iter().collect();

        let mut transactions = Vec::new();
        for record in pending {
            let participant_prepared = rm_prepared.remove(&record.xid);
            if record.status == TransactionStatus::Prepared || participant_prepared {
                transactions.push(InDoubtTransaction {
                    record,
                    participant_prepared,
                });
            }
        }

        Self {
            transactions,
            orphaned: rm_prepared.into_iter().collect(),
        }
    }
}

/// What happened to one pending record handed to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Load {
    Loaded(TransactionStatus),
    AlreadyActive,
    /// finished between the log read and the insert
    Finished,
}

/// Loads pending log records into the active table.
pub(crate) struct RecoveryScanner<'a, B> {
    log: &'a dyn TransactionLog,
    table: &'a ActiveTransactionTable<B>,
}

impl<'a, B> RecoveryScanner<'a, B> {
    pub fn new(log: &'a dyn TransactionLog, table: &'a ActiveTransactionTable<B>) -> Self {
        Self { log, table }
    }

    pub fn scan(&self) -> LogResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.log.scan_pending()? {
            let xid = record.xid.clone();
            match self.load(record)? {
                Load::Loaded(status) => {
                    debug!(xid = %xid, %status, "recovered transaction");
                    match status {
                        TransactionStatus::Prepared => report.prepared += 1,
                        _ => report.started += 1,
                    }
                    report.loaded.push(xid);
                }
                Load::AlreadyActive => report.already_active += 1,
                Load::Finished => debug!(xid = %xid, "finished during recovery, skipped"),
            }
        }

        info!(
            loaded = report.loaded.len(),
            prepared = report.prepared,
            already_active = report.already_active,
            "recovery scan complete"
        );
        Ok(report)
    }

    /// Insert one pending record, then re-read it from the log while holding
    /// the new entry's lock. The record may have been finished by another
    /// coordinator handle after it was read; such an entry is removed again.
    pub fn load(&self, record: TransactionRecord) -> LogResult<Load> {
        let xid = record.xid.clone();
        if !self.table.insert_recovered(record) {
            return Ok(Load::AlreadyActive);
        }
        let Some(slot) = self.table.slot(&xid) else {
            return Ok(Load::Finished);
        };
        let _guard = slot.lock();

        match self.log.get(&xid) {
            Ok(Some(current)) if !current.is_terminal() => {
                let status = current.status;
                self.table.update(current);
                Ok(Load::Loaded(status))
            }
            Ok(_) => {
                self.table.remove(&xid);
                Ok(Load::Finished)
            }
            Err(e) => {
                self.table.remove(&xid);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txlog::MemoryTransactionLog;

    fn record(xid: &str, status: TransactionStatus, create_time: u64) -> TransactionRecord {
        TransactionRecord {
            status,
            create_time,
            update_time: create_time,
            ..TransactionRecord::started(xid, format!("O-{}", xid), Vec::new())
        }
    }

    #[test]
    fn test_scan_preserves_status_and_times() {
        let log = MemoryTransactionLog::new();
        log.append(&record("TXN_a", TransactionStatus::Started, 100)).unwrap();
        log.append(&record("TXN_b", TransactionStatus::Prepared, 200)).unwrap();
        log.append(&record("TXN_c", TransactionStatus::Committed, 300)).unwrap();

        let table: ActiveTransactionTable<()> = ActiveTransactionTable::new();
        let report = RecoveryScanner::new(&log, &table).scan().unwrap();

        assert_eq!(report.loaded, vec!["TXN_a", "TXN_b"]);
        assert_eq!((report.started, report.prepared), (1, 1));
        let b = table.record("TXN_b").unwrap();
        assert_eq!(b.status, TransactionStatus::Prepared);
        assert_eq!(b.create_time, 200);
        assert!(!table.contains("TXN_c"));
    }

    #[test]
    fn test_scan_is_idempotent() {
        let log = MemoryTransactionLog::new();
        log.append(&record("TXN_a", TransactionStatus::Started, 100)).unwrap();

        let table: ActiveTransactionTable<()> = ActiveTransactionTable::new();
        RecoveryScanner::new(&log, &table).scan().unwrap();
        let again = RecoveryScanner::new(&log, &table).scan().unwrap();

        assert!(again.loaded.is_empty());
        assert_eq!(again.already_active, 1);
        assert_eq!(table.len(), 1);
    }

    /// Serves a fixed pending snapshot while reads go to the live log, as if
    /// the transactions moved on right after the scan.
    struct StaleScanLog {
        live: MemoryTransactionLog,
        snapshot: Vec<TransactionRecord>,
    }

    impl TransactionLog for StaleScanLog {
        fn append(&self, record: &TransactionRecord) -> LogResult<()> {
            self.live.append(record)
        }

        fn update(&self, xid: &str, status: TransactionStatus) -> LogResult<TransactionRecord> {
            self.live.update(xid, status)
        }

        fn get(&self, xid: &str) -> LogResult<Option<TransactionRecord>> {
            self.live.get(xid)
        }

        fn scan_pending(&self) -> LogResult<Vec<TransactionRecord>> {
            Ok(self.snapshot.clone())
        }

        fn purge(&self, before: u64) -> LogResult<usize> {
            self.live.purge(before)
        }
    }

    #[test]
    fn test_scan_drops_records_finished_after_the_read() {
        let live = MemoryTransactionLog::new();
        live.append(&record("TXN_a", TransactionStatus::Started, 100)).unwrap();
        live.append(&record("TXN_b", TransactionStatus::Started, 200)).unwrap();
        live.append(&record("TXN_c", TransactionStatus::Started, 300)).unwrap();
        let snapshot = live.scan_pending().unwrap();

        live.update("TXN_a", TransactionStatus::Committed).unwrap();
        live.update("TXN_b", TransactionStatus::Prepared).unwrap();
        live.purge(u64::MAX).unwrap();
        let log = StaleScanLog { live, snapshot };

        let table: ActiveTransactionTable<()> = ActiveTransactionTable::new();
        let report = RecoveryScanner::new(&log, &table).scan().unwrap();

        assert_eq!(report.loaded, vec!["TXN_b", "TXN_c"]);
        assert_eq!((report.started, report.prepared), (1, 1));
        assert!(!table.contains("TXN_a"));
        assert_eq!(table.status("TXN_b"), Some(TransactionStatus::Prepared));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_load_skips_purged_record() {
        let log = MemoryTransactionLog::new();
        let stale = record("TXN_a", TransactionStatus::Started, 100);

        let table: ActiveTransactionTable<()> = ActiveTransactionTable::new();
        let outcome = RecoveryScanner::new(&log, &table).load(stale).unwrap();

        assert_eq!(outcome, Load::Finished);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_classify_in_doubt() {
        let pending = vec![
            record("TXN_a", TransactionStatus::Prepared, 1),
            record("TXN_b", TransactionStatus::Prepared, 2),
            record("TXN_c", TransactionStatus::Started, 3),
        ];
        let rm = vec!["TXN_a".to_string(), "TXN_c".to_string(), "TXN_z".to_string()];

        let report = InDoubtReport::classify(pending, rm);
        let summary: Vec<_> = report
            .transactions
            .iter()
            .map(|t| (t.record.xid.as_str(), t.participant_prepared))
            .collect();
        assert_eq!(
            summary,
            vec![("TXN_a", true), ("TXN_b", false), ("TXN_c", true)]
        );
        assert_eq!(report.orphaned, vec!["TXN_z"]);
    }
}
