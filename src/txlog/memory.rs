//! In-process transaction log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::txlog::error::{LogError, LogResult};
use crate::txlog::record::{unix_now, TransactionRecord, TransactionStatus};
use crate::txlog::{sort_records, TransactionLog};

/// [`TransactionLog`] held in memory; nothing survives the process.
///
/// `set_fail_writes(true)` makes every append, update and purge fail with
/// `Unavailable` without touching the stored records.
#[derive(Debug, Default)]
pub struct MemoryTransactionLog {
    records: RwLock<HashMap<String, TransactionRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_writable(&self) -> LogResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn append(&self, record: &TransactionRecord) -> LogResult<()> {
        self.check_writable()?;
        let mut records = self.records.write();
        if records.contains_key(&record.xid) {
            return Err(LogError::Duplicate(record.xid.clone()));
        }
        records.insert(record.xid.clone(), record.clone());
        Ok(())
    }

    fn update(&self, xid: &str, status: TransactionStatus) -> LogResult<TransactionRecord> {
        self.check_writable()?;
        let mut records = self.records.write();
        let current = records
            .get_mut(xid)
            .ok_or_else(|| LogError::NotFound(xid.to_string()))?;
        let next = current.advanced(status, unix_now())?;
        *current = next.clone();
        Ok(next)
    }

    fn get(&self, xid: &str) -> LogResult<Option<TransactionRecord>> {
        Ok(self.records.read().get(xid).cloned())
    }

    fn scan_pending(&self) -> LogResult<Vec<TransactionRecord>> {
        let mut pending: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|record| !record.is_terminal())
            .cloned()
            .collect();
        sort_records(&mut pending);
        Ok(pending)
    }

    fn purge(&self, before: u64) -> LogResult<usize> {
        self.check_writable()?;
        let mut records = self.records.write();
        let len_before = records.len();
        records.retain(|_, record| !(record.is_terminal() && record.update_time < before));
        Ok(len_before - records.len())
    }
}
