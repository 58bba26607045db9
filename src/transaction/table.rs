//! The active transaction table.
//!
//! In-memory view of every transaction the coordinator is driving, keyed by
//! xid, with a secondary index from order number to xid. The table lock
//! covers lookups and membership changes only; the work on a single xid is
//! serialized by that entry's branch slot, which callers lock outside the
//! table lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::txlog::{TransactionRecord, TransactionStatus};

/// The branch of one xid; `None` until a recovered entry is re-attached.
pub(crate) type BranchSlot<B> = Arc<Mutex<Option<B>>>;

struct ActiveEntry<B> {
    record: TransactionRecord,
    slot: BranchSlot<B>,
}

struct TableInner<B> {
    entries: HashMap<String, ActiveEntry<B>>,
    /// order_no -> xid, maintained only for reservations
    orders: HashMap<String, String>,
}

pub(crate) struct ActiveTransactionTable<B> {
    inner: RwLock<TableInner<B>>,
}

impl<B> ActiveTransactionTable<B> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                entries: HashMap::new(),
                orders: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn contains(&self, xid: &str) -> bool {
        self.inner.read().entries.contains_key(xid)
    }

    pub fn record(&self, xid: &str) -> Option<TransactionRecord> {
        self.inner.read().entries.get(xid).map(|e| e.record.clone())
    }

    pub fn status(&self, xid: &str) -> Option<TransactionStatus> {
        self.inner.read().entries.get(xid).map(|e| e.record.status)
    }

    pub fn slot(&self, xid: &str) -> Option<BranchSlot<B>> {
        self.inner.read().entries.get(xid).map(|e| Arc::clone(&e.slot))
    }

    /// Snapshot of all records, oldest first.
    pub fn records(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self
            .inner
            .read()
            .entries
            .values()
            .map(|e| e.record.clone())
            .collect();
        crate::txlog::sort_records(&mut records);
        records
    }

    /// Claim `order_no` for `xid`. Returns the current holder if taken.
    pub fn reserve_order(&self, order_no: &str, xid: &str) -> Result<(), String> {
        let mut inner = self.inner.write();
        if let Some(holder) = inner.orders.get(order_no) {
            return Err(holder.clone());
        }
        inner.orders.insert(order_no.to_string(), xid.to_string());
        Ok(())
    }

    pub fn release_order(&self, order_no: &str, xid: &str) {
        let mut inner = self.inner.write();
        if inner.orders.get(order_no).map(String::as_str) == Some(xid) {
            inner.orders.remove(order_no);
        }
    }

    /// Register a freshly started transaction with its branch.
    pub fn insert(&self, record: TransactionRecord, branch: B) -> BranchSlot<B> {
        let slot = Arc::new(Mutex::new(Some(branch)));
        let mut inner = self.inner.write();
        inner.entries.insert(
            record.xid.clone(),
            ActiveEntry {
                record,
                slot: Arc::clone(&slot),
            },
        );
        slot
    }

    /// Register a record loaded from the log unless the xid is already
    /// tracked. Claims the order number if it is free.
    pub fn insert_recovered(&self, record: TransactionRecord) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&record.xid) {
            return false;
        }
        if !inner.orders.contains_key(&record.order_no) {
            inner
                .orders
                .insert(record.order_no.clone(), record.xid.clone());
        }
        inner.entries.insert(
            record.xid.clone(),
            ActiveEntry {
                record,
                slot: Arc::new(Mutex::new(None)),
            },
        );
        true
    }

    /// Replace the stored record of a tracked xid.
    pub fn update(&self, record: TransactionRecord) {
        if let Some(entry) = self.inner.write().entries.get_mut(&record.xid) {
            entry.record = record;
        }
    }

    pub fn remove(&self, xid: &str) -> Option<TransactionRecord> {
        let mut inner = self.inner.write();
        let entry = inner.entries.remove(xid)?;
        if inner.orders.get(&entry.record.order_no).map(String::as_str) == Some(xid) {
            inner.orders.remove(&entry.record.order_no);
        }
        Some(entry.record)
    }
}
