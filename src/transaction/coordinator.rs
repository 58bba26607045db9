//! The two-phase commit coordinator.
//!
//! Every state change is written to the transaction log first and becomes
//! visible in the active table only after the write succeeded. Operations on
//! one xid are serialized by that xid's branch slot; the table lock is held
//! only for map operations, never across log or resource manager calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::resource::{
    BranchError, BranchResult, BranchState, ResourceManager, TransactionBranch, Vote,
};
use crate::transaction::config::CoordinatorConfig;
use crate::transaction::error::{CoordinatorError, CoordinatorResult};
use crate::transaction::recovery::{InDoubtReport, RecoveryReport, RecoveryScanner};
use crate::transaction::table::{ActiveTransactionTable, BranchSlot};
use crate::transaction::xid::XidGenerator;
use crate::txlog::{LogError, TransactionLog, TransactionRecord, TransactionStatus};

/// Drives transactions across a resource manager with a durable log.
///
/// Cheap to clone; clones share the same table, log and resource manager.
pub struct TransactionCoordinator<R: ResourceManager> {
    inner: Arc<CoordinatorInner<R>>,
}

struct CoordinatorInner<R: ResourceManager> {
    config: CoordinatorConfig,
    rm: R,
    log: Arc<dyn TransactionLog>,
    table: ActiveTransactionTable<R::Branch>,
    xids: XidGenerator,
}

impl<R: ResourceManager> Clone for TransactionCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Access to the branch of a started transaction for local writes.
pub struct TransactionHandle<B> {
    xid: String,
    slot: BranchSlot<B>,
}

impl<B> TransactionHandle<B> {
    pub fn xid(&self) -> &str {
        &self.xid
    }

    /// Run `f` against the branch while holding the xid's lock.
    pub fn with_branch<T, F>(&self, f: F) -> CoordinatorResult<T>
    where
        F: FnOnce(&mut B) -> BranchResult<T>,
    {
        let mut guard = self.slot.lock();
        let branch = guard
            .as_mut()
            .ok_or_else(|| CoordinatorError::NotFound(self.xid.clone()))?;
        f(branch).map_err(|e| CoordinatorError::from_branch(&self.xid, e))
    }
}

impl<R: ResourceManager> TransactionCoordinator<R> {
    pub fn new(
        config: CoordinatorConfig,
        rm: R,
        log: Arc<dyn TransactionLog>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                rm,
                log,
                table: ActiveTransactionTable::new(),
                xids: XidGenerator::new(),
            }),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn resource_manager(&self) -> &R {
        &self.inner.rm
    }

    pub fn log(&self) -> &Arc<dyn TransactionLog> {
        &self.inner.log
    }

    // ==================== Lifecycle ====================

    /// Begin a new transaction for `order_no`.
    ///
    /// The branch is begun and the STARTED record logged before the
    /// transaction appears in the active table. If the log write fails the
    /// branch is rolled back again.
    pub fn start_transaction(
        &self,
        order_no: &str,
    ) -> CoordinatorResult<TransactionHandle<R::Branch>> {
        let inner = &self.inner;
        let xid = inner.xids.generate(&inner.config.xid_prefix);

        if inner.config.enforce_unique_order {
            if let Err(holder) = inner.table.reserve_order(order_no, &xid) {
                return Err(CoordinatorError::Duplicate {
                    order_no: order_no.to_string(),
                    xid: holder,
                });
            }
        }

        match self.begin_branch(&xid, order_no) {
            Ok((record, branch)) => {
                let slot = inner.table.insert(record, branch);
                info!(xid = %xid, order_no, "transaction started");
                Ok(TransactionHandle { xid, slot })
            }
            Err(e) => {
                inner.table.release_order(order_no, &xid);
                warn!(xid = %xid, order_no, error = %e, "transaction start failed");
                Err(e)
            }
        }
    }

    fn begin_branch(
        &self,
        xid: &str,
        order_no: &str,
    ) -> CoordinatorResult<(TransactionRecord, R::Branch)> {
        let inner = &self.inner;
        let mut branch = inner
            .rm
            .connect()
            .map_err(|e| CoordinatorError::from_branch(xid, e))?;
        branch
            .begin(xid)
            .map_err(|e| CoordinatorError::from_branch(xid, e))?;

        let record = TransactionRecord::started(xid, order_no, inner.config.participants.clone());
        if let Err(e) = inner.log.append(&record) {
            if let Err(rollback_err) = branch.rollback() {
                warn!(xid, error = %rollback_err, "branch left behind after log failure");
            }
            return Err(CoordinatorError::Persistence(e));
        }
        Ok((record, branch))
    }

    /// Ask the participant to prepare.
    ///
    /// Returns `false` when it votes abort or refuses; the record stays
    /// STARTED so the caller can roll back.
    pub fn prepare_transaction(&self, xid: &str) -> CoordinatorResult<bool> {
        let slot = self.slot(xid)?;
        let mut guard = slot.lock();
        let current = self.tracked_status(xid)?;
        check_transition(xid, current, TransactionStatus::Prepared)?;

        let branch = self.attached(xid, &mut guard)?;
        match branch.prepare() {
            Ok(Vote::Commit) => {}
            Ok(Vote::Abort) => {
                info!(xid, "participant voted abort");
                return Ok(false);
            }
            Err(BranchError::Protocol { reason, .. }) => {
                warn!(xid, reason = %reason, "participant refused to prepare");
                return Ok(false);
            }
            Err(e) => return Err(CoordinatorError::from_branch(xid, e)),
        }

        let record = self
            .inner
            .log
            .update(xid, TransactionStatus::Prepared)
            .map_err(|e| log_failure(xid, e))?;
        self.inner.table.update(record);
        debug!(xid, "transaction prepared");
        Ok(true)
    }

    /// Commit the participant's branch and log COMMITTED.
    ///
    /// A prior prepare is not required. If the participant rejects the
    /// commit the transaction is marked FAILED and `false` is returned.
    pub fn commit_transaction(&self, xid: &str) -> CoordinatorResult<bool> {
        let slot = self.slot(xid)?;
        let mut guard = slot.lock();
        let current = self.tracked_status(xid)?;
        check_transition(xid, current, TransactionStatus::Committed)?;

        let branch = self.attached(xid, &mut guard)?;
        match branch.commit() {
            Ok(()) => {}
            Err(e @ (BranchError::Protocol { .. } | BranchError::Conflict { .. })) => {
                warn!(xid, error = %e, "commit rejected, marking transaction failed");
                self.finish(xid, TransactionStatus::Failed)?;
                return Ok(false);
            }
            Err(e) => return Err(CoordinatorError::from_branch(xid, e)),
        }

        self.finish(xid, TransactionStatus::Committed)?;
        info!(xid, from = %current, "transaction committed");
        Ok(true)
    }

    /// Roll back the participant's branch and log ROLLED_BACK.
    ///
    /// Rolling back an xid the log already holds as finished succeeds without
    /// side effects. An xid that is pending in the log but not loaded into
    /// the table is loaded first. A participant that already committed the
    /// branch is never rolled back; the caller has to finish the commit.
    pub fn rollback_transaction(&self, xid: &str) -> CoordinatorResult<bool> {
        let Some(slot) = self.inner.table.slot(xid) else {
            return self.rollback_untracked(xid);
        };
        let mut guard = slot.lock();
        let Some(current) = self.inner.table.status(xid) else {
            drop(guard);
            return self.rollback_untracked(xid);
        };
        check_transition(xid, current, TransactionStatus::RolledBack)?;

        let outcome = match self.attached(xid, &mut guard) {
            Ok(branch) => {
                if branch.state() == BranchState::Committed {
                    return Err(already_committed(xid));
                }
                let result = branch.rollback();
                if branch.state() == BranchState::Committed {
                    return Err(already_committed(xid));
                }
                result
            }
            Err(CoordinatorError::NotFound(_)) => {
                debug!(xid, "participant holds no branch, nothing to undo");
                Ok(())
            }
            Err(e) => return Err(e),
        };
        match outcome {
            Ok(()) | Err(BranchError::NotFound(_)) => {}
            Err(e @ BranchError::Connection { .. }) => {
                return Err(CoordinatorError::from_branch(xid, e))
            }
            Err(e) => {
                warn!(xid, error = %e, "rollback rejected, marking transaction failed");
                self.finish(xid, TransactionStatus::Failed)?;
                return Ok(false);
            }
        }

        self.finish(xid, TransactionStatus::RolledBack)?;
        info!(xid, from = %current, "transaction rolled back");
        Ok(true)
    }

    fn rollback_untracked(&self, xid: &str) -> CoordinatorResult<bool> {
        match self.inner.log.get(xid)? {
            None => Err(CoordinatorError::NotFound(xid.to_string())),
            Some(record) if record.is_terminal() => {
                debug!(xid, status = %record.status, "already finished, nothing to roll back");
                Ok(true)
            }
            Some(record) => {
                RecoveryScanner::new(self.inner.log.as_ref(), &self.inner.table).load(record)?;
                self.rollback_transaction(xid)
            }
        }
    }

    /// Start, run `f` on the branch, prepare and commit; roll back if any
    /// step before the commit fails. Returns the xid with `f`'s value.
    pub fn with_transaction<T, F>(&self, order_no: &str, f: F) -> CoordinatorResult<(String, T)>
    where
        F: FnOnce(&mut R::Branch) -> BranchResult<T>,
    {
        let handle = self.start_transaction(order_no)?;
        let xid = handle.xid().to_string();

        let value = match handle.with_branch(f) {
            Ok(value) => value,
            Err(e) => {
                self.abandon(&xid);
                return Err(e);
            }
        };

        match self.prepare_transaction(&xid) {
            Ok(true) => {}
            Ok(false) => {
                self.abandon(&xid);
                return Err(CoordinatorError::Protocol {
                    xid,
                    reason: "participant did not vote commit".to_string(),
                });
            }
            Err(e) => {
                self.abandon(&xid);
                return Err(e);
            }
        }

        if !self.commit_transaction(&xid)? {
            return Err(CoordinatorError::Protocol {
                xid,
                reason: "commit rejected, transaction marked FAILED".to_string(),
            });
        }
        Ok((xid, value))
    }

    fn abandon(&self, xid: &str) {
        if let Err(e) = self.rollback_transaction(xid) {
            warn!(xid, error = %e, "rollback after failure did not complete");
        }
    }

    // ==================== Queries ====================

    /// Status of an active transaction. Finished transactions are only in
    /// the log and report `NotFound` here.
    pub fn get_transaction_status(&self, xid: &str) -> CoordinatorResult<TransactionStatus> {
        self.tracked_status(xid)
    }

    /// Snapshot of the active table, oldest first.
    pub fn get_pending_transactions(&self) -> Vec<TransactionRecord> {
        self.inner.table.records()
    }

    pub fn active_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_active(&self, xid: &str) -> bool {
        self.inner.table.contains(xid)
    }

    /// Branch access for an active xid, re-attaching a recovered one.
    pub fn handle(&self, xid: &str) -> CoordinatorResult<TransactionHandle<R::Branch>> {
        let slot = self.slot(xid)?;
        {
            let mut guard = slot.lock();
            self.attached(xid, &mut guard)?;
        }
        Ok(TransactionHandle {
            xid: xid.to_string(),
            slot,
        })
    }

    // ==================== Recovery ====================

    /// Reload STARTED and PREPARED records from the log into the table.
    ///
    /// Entries already tracked are left as they are; loaded records keep
    /// their logged status and timestamps.
    pub fn recover_transactions(&self) -> CoordinatorResult<RecoveryReport> {
        Ok(RecoveryScanner::new(self.inner.log.as_ref(), &self.inner.table).scan()?)
    }

    /// Delete terminal log records last updated before `before` (unix
    /// seconds). Active transactions are never touched.
    pub fn cleanup_transactions(&self, before: u64) -> CoordinatorResult<usize> {
        let removed = self.inner.log.purge(before)?;
        info!(removed, before, "cleaned up transaction log");
        Ok(removed)
    }

    /// Compare pending log records with what the participant holds
    /// prepared. Read-only; nothing is resolved.
    pub fn in_doubt_transactions(&self) -> CoordinatorResult<InDoubtReport> {
        let pending = self.inner.log.scan_pending()?;
        let rm_prepared = self
            .inner
            .rm
            .recover()
            .map_err(|e| CoordinatorError::from_branch(self.inner.rm.name(), e))?;
        Ok(InDoubtReport::classify(pending, rm_prepared))
    }

    // ==================== Internals ====================

    fn slot(&self, xid: &str) -> CoordinatorResult<BranchSlot<R::Branch>> {
        self.inner
            .table
            .slot(xid)
            .ok_or_else(|| CoordinatorError::NotFound(xid.to_string()))
    }

    fn tracked_status(&self, xid: &str) -> CoordinatorResult<TransactionStatus> {
        self.inner
            .table
            .status(xid)
            .ok_or_else(|| CoordinatorError::NotFound(xid.to_string()))
    }

    /// The branch in `slot`, attaching to the participant if the entry was
    /// recovered from the log.
    fn attached<'s>(
        &self,
        xid: &str,
        slot: &'s mut Option<R::Branch>,
    ) -> CoordinatorResult<&'s mut R::Branch> {
        if slot.is_none() {
            let branch = self
                .inner
                .rm
                .attach(xid)
                .map_err(|e| CoordinatorError::from_branch(xid, e))?;
            debug!(xid, state = %branch.state(), "re-attached recovered branch");
            *slot = Some(branch);
        }
        slot.as_mut()
            .ok_or_else(|| CoordinatorError::NotFound(xid.to_string()))
    }

    /// Log a terminal status and drop the xid from the table.
    fn finish(&self, xid: &str, status: TransactionStatus) -> CoordinatorResult<()> {
        self.inner
            .log
            .update(xid, status)
            .map_err(|e| log_failure(xid, e))?;
        self.inner.table.remove(xid);
        Ok(())
    }
}

fn check_transition(
    xid: &str,
    from: TransactionStatus,
    to: TransactionStatus,
) -> CoordinatorResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidTransition {
            xid: xid.to_string(),
            from,
            to,
        })
    }
}

fn already_committed(xid: &str) -> CoordinatorError {
    warn!(xid, "participant already committed, refusing to roll back");
    CoordinatorError::Protocol {
        xid: xid.to_string(),
        reason: "participant already committed, finish it with commit_transaction".to_string(),
    }
}

fn log_failure(xid: &str, err: LogError) -> CoordinatorError {
    match err {
        LogError::InvalidTransition(t) => t.into(),
        other => {
            warn!(xid, error = %other, "log write failed after participant call, record is in doubt");
            CoordinatorError::Persistence(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    use serde_json::json;

    use crate::resource::{FaultPlan, MemoryBranch, MemoryResourceManager};
    use crate::txlog::MemoryTransactionLog;

    struct Fixture {
        rm: MemoryResourceManager,
        log: Arc<MemoryTransactionLog>,
        coordinator: TransactionCoordinator<MemoryResourceManager>,
    }

    fn fixture_with(config: CoordinatorConfig) -> Fixture {
        let rm = MemoryResourceManager::new("orders");
        let log = Arc::new(MemoryTransactionLog::new());
        let coordinator = TransactionCoordinator::new(config, rm.clone(), log.clone()).unwrap();
        Fixture {
            rm,
            log,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinatorConfig::default())
    }

    fn put_order(branch: &mut MemoryBranch) -> BranchResult<()> {
        branch.put("orders", "o1", json!({ "amount": 9999 }))
    }

    #[test]
    fn test_start_logs_before_table() {
        let f = fixture();
        let handle = f.coordinator.start_transaction("ORDER1").unwrap();
        let xid = handle.xid();

        assert!(xid.starts_with("TXN_"));
        assert_eq!(
            f.coordinator.get_transaction_status(xid).unwrap(),
            TransactionStatus::Started
        );
        let logged = f.log.get(xid).unwrap().unwrap();
        assert_eq!(logged.order_no, "ORDER1");
        assert_eq!(logged.participants, vec!["orders", "payments"]);
    }

    #[test]
    fn test_full_commit_then_status_not_found() {
        let f = fixture();
        let handle = f.coordinator.start_transaction("ORDER1").unwrap();
        let xid = handle.xid().to_string();
        handle.with_branch(put_order).unwrap();

        assert!(f.coordinator.prepare_transaction(&xid).unwrap());
        assert_eq!(
            f.coordinator.get_transaction_status(&xid).unwrap(),
            TransactionStatus::Prepared
        );
        assert!(f.coordinator.commit_transaction(&xid).unwrap());

        assert!(matches!(
            f.coordinator.get_transaction_status(&xid),
            Err(CoordinatorError::NotFound(_))
        ));
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
        assert_eq!(f.rm.get("orders", "o1"), Some(json!({ "amount": 9999 })));
    }

    #[test]
    fn test_start_then_rollback() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();

        assert!(f.coordinator.rollback_transaction(&xid).unwrap());
        assert!(!f.coordinator.is_active(&xid));
        assert_eq!(f.coordinator.active_count(), 0);
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::RolledBack);

        // again: answered from the log
        assert!(f.coordinator.rollback_transaction(&xid).unwrap());
    }

    #[test]
    fn test_commit_without_prepare() {
        let f = fixture();
        let handle = f.coordinator.start_transaction("ORDER1").unwrap();
        let xid = handle.xid().to_string();
        handle.with_branch(put_order).unwrap();

        assert!(f.coordinator.commit_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
        assert!(f.rm.get("orders", "o1").is_some());
    }

    #[test]
    fn test_unknown_xid() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.prepare_transaction("TXN_0_x"),
            Err(CoordinatorError::NotFound(_))
        ));
        assert!(matches!(
            f.coordinator.commit_transaction("TXN_0_x"),
            Err(CoordinatorError::NotFound(_))
        ));
        assert!(matches!(
            f.coordinator.rollback_transaction("TXN_0_x"),
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[test]
    fn test_rollback_after_commit_is_noop() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&xid).unwrap();
        f.coordinator.commit_transaction(&xid).unwrap();

        assert!(f.coordinator.rollback_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
        assert_eq!(f.rm.branch_state(&xid), Some(BranchState::Committed));
    }

    #[test]
    fn test_rollback_after_failure_is_noop() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.rm.set_faults(FaultPlan {
            reject_commit: true,
            ..FaultPlan::default()
        });
        assert!(!f.coordinator.commit_transaction(&xid).unwrap());

        assert!(f.coordinator.rollback_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Failed);
    }

    #[test]
    fn test_rollback_refused_once_participant_committed() {
        let f = fixture();
        let handle = f.coordinator.start_transaction("ORDER1").unwrap();
        let xid = handle.xid().to_string();
        handle.with_branch(put_order).unwrap();
        f.coordinator.prepare_transaction(&xid).unwrap();

        f.log.set_fail_writes(true);
        assert!(matches!(
            f.coordinator.commit_transaction(&xid),
            Err(CoordinatorError::Persistence(_))
        ));
        f.log.set_fail_writes(false);

        assert!(matches!(
            f.coordinator.rollback_transaction(&xid),
            Err(CoordinatorError::Protocol { .. })
        ));
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Prepared);

        // a restarted coordinator re-attaches and refuses as well
        let restarted =
            TransactionCoordinator::new(CoordinatorConfig::default(), f.rm.clone(), f.log.clone())
                .unwrap();
        assert!(matches!(
            restarted.rollback_transaction(&xid),
            Err(CoordinatorError::Protocol { .. })
        ));
        assert!(restarted.commit_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
        assert!(f.rm.get("orders", "o1").is_some());
    }

    #[test]
    fn test_prepare_twice_is_invalid() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        assert!(f.coordinator.prepare_transaction(&xid).unwrap());
        assert!(matches!(
            f.coordinator.prepare_transaction(&xid),
            Err(CoordinatorError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unreachable_rm_fails_start() {
        let f = fixture();
        f.rm.set_reachable(false);

        assert!(matches!(
            f.coordinator.start_transaction("ORDER1"),
            Err(CoordinatorError::Connection(_))
        ));
        assert_eq!(f.coordinator.active_count(), 0);
        assert!(f.log.is_empty());
    }

    #[test]
    fn test_log_failure_on_start_rolls_back_branch() {
        let f = fixture();
        f.log.set_fail_writes(true);

        let result = f.coordinator.start_transaction("ORDER1");
        assert!(matches!(result, Err(CoordinatorError::Persistence(_))));
        assert_eq!(f.coordinator.active_count(), 0);
        assert!(f.rm.recover().unwrap().is_empty());
    }

    #[test]
    fn test_abort_vote_keeps_record() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.rm.set_faults(FaultPlan {
            vote_abort: true,
            ..FaultPlan::default()
        });

        assert!(!f.coordinator.prepare_transaction(&xid).unwrap());
        assert_eq!(
            f.coordinator.get_transaction_status(&xid).unwrap(),
            TransactionStatus::Started
        );

        f.rm.set_faults(FaultPlan::default());
        assert!(f.coordinator.rollback_transaction(&xid).unwrap());
    }

    #[test]
    fn test_prepare_rejection_returns_false() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.rm.set_faults(FaultPlan {
            reject_prepare: true,
            ..FaultPlan::default()
        });

        assert!(!f.coordinator.prepare_transaction(&xid).unwrap());
        assert!(f.coordinator.is_active(&xid));
    }

    #[test]
    fn test_commit_rejection_marks_failed() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&xid).unwrap();
        f.rm.set_faults(FaultPlan {
            reject_commit: true,
            ..FaultPlan::default()
        });

        assert!(!f.coordinator.commit_transaction(&xid).unwrap());
        assert!(!f.coordinator.is_active(&xid));
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Failed);
    }

    #[test]
    fn test_connection_loss_at_commit_keeps_record() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&xid).unwrap();
        f.rm.set_reachable(false);

        assert!(matches!(
            f.coordinator.commit_transaction(&xid),
            Err(CoordinatorError::Connection(_))
        ));
        assert_eq!(
            f.coordinator.get_transaction_status(&xid).unwrap(),
            TransactionStatus::Prepared
        );

        f.rm.set_reachable(true);
        assert!(f.coordinator.commit_transaction(&xid).unwrap());
    }

    #[test]
    fn test_log_failure_after_commit_can_be_retried() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&xid).unwrap();

        f.log.set_fail_writes(true);
        assert!(matches!(
            f.coordinator.commit_transaction(&xid),
            Err(CoordinatorError::Persistence(_))
        ));
        assert!(f.coordinator.is_active(&xid));

        f.log.set_fail_writes(false);
        assert!(f.coordinator.commit_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
    }

    #[test]
    fn test_duplicate_order_enforced() {
        let f = fixture_with(CoordinatorConfig::default().enforce_unique_order(true));
        let first = f.coordinator.start_transaction("ORDER1").unwrap();

        match f.coordinator.start_transaction("ORDER1") {
            Err(CoordinatorError::Duplicate { order_no, xid }) => {
                assert_eq!(order_no, "ORDER1");
                assert_eq!(xid, first.xid());
            }
            other => panic!("expected duplicate, got {:?}", other.map(|h| h.xid().to_string())),
        }

        f.coordinator.rollback_transaction(first.xid()).unwrap();
        f.coordinator.start_transaction("ORDER1").unwrap();
    }

    #[test]
    fn test_duplicate_order_allowed_by_default() {
        let f = fixture();
        f.coordinator.start_transaction("ORDER1").unwrap();
        f.coordinator.start_transaction("ORDER1").unwrap();
        assert_eq!(f.coordinator.active_count(), 2);
    }

    #[test]
    fn test_concurrent_starts() {
        let f = fixture();
        let threads: Vec<_> = (0..16)
            .map(|i| {
                let coordinator = f.coordinator.clone();
                thread::spawn(move || {
                    coordinator
                        .start_transaction(&format!("ORDER{}", i))
                        .unwrap()
                        .xid()
                        .to_string()
                })
            })
            .collect();

        let xids: HashSet<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(xids.len(), 16);
        assert_eq!(f.log.len(), 16);
        assert_eq!(f.coordinator.active_count(), 16);
    }

    #[test]
    fn test_recovery_preserves_records() {
        let f = fixture();
        let started = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        let prepared = f.coordinator.start_transaction("ORDER2").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&prepared).unwrap();
        let logged_started = f.log.get(&started).unwrap().unwrap();

        // a new coordinator over the same log and participant
        let restarted =
            TransactionCoordinator::new(CoordinatorConfig::default(), f.rm.clone(), f.log.clone())
                .unwrap();
        assert_eq!(restarted.active_count(), 0);

        let report = restarted.recover_transactions().unwrap();
        assert_eq!(report.loaded.len(), 2);
        assert_eq!(
            restarted.get_transaction_status(&prepared).unwrap(),
            TransactionStatus::Prepared
        );
        let pending = restarted.get_pending_transactions();
        let recovered = pending.iter().find(|r| r.xid == started).unwrap();
        assert_eq!(recovered.create_time, logged_started.create_time);
        assert_eq!(recovered.status, TransactionStatus::Started);

        assert!(restarted.commit_transaction(&prepared).unwrap());
        assert!(restarted.rollback_transaction(&started).unwrap());
        assert_eq!(restarted.active_count(), 0);
    }

    #[test]
    fn test_recovery_does_not_clobber_active_entries() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        let report = f.coordinator.recover_transactions().unwrap();

        assert!(report.loaded.is_empty());
        assert_eq!(report.already_active, 1);
        // the live branch is still usable
        f.coordinator.handle(&xid).unwrap().with_branch(put_order).unwrap();
    }

    #[test]
    fn test_rollback_of_unloaded_log_record() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();

        let restarted =
            TransactionCoordinator::new(CoordinatorConfig::default(), f.rm.clone(), f.log.clone())
                .unwrap();
        assert!(restarted.rollback_transaction(&xid).unwrap());
        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::RolledBack);
    }

    #[test]
    fn test_cleanup_keeps_pending() {
        let f = fixture();
        let done = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.commit_transaction(&done).unwrap();
        let open = f.coordinator.start_transaction("ORDER2").unwrap().xid().to_string();

        let removed = f.coordinator.cleanup_transactions(u64::MAX).unwrap();
        assert_eq!(removed, 1);
        assert!(f.log.get(&done).unwrap().is_none());
        assert!(f.log.get(&open).unwrap().is_some());
    }

    #[test]
    fn test_in_doubt_report() {
        let f = fixture();
        let xid = f.coordinator.start_transaction("ORDER1").unwrap().xid().to_string();
        f.coordinator.prepare_transaction(&xid).unwrap();
        f.coordinator.start_transaction("ORDER2").unwrap();

        let report = f.coordinator.in_doubt_transactions().unwrap();
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(report.transactions[0].record.xid, xid);
        assert!(report.transactions[0].participant_prepared);
        assert!(report.orphaned.is_empty());
        // read-only
        assert!(f.coordinator.is_active(&xid));
    }

    #[test]
    fn test_with_transaction_commits() {
        let f = fixture();
        let (xid, ()) = f.coordinator.with_transaction("ORDER1", put_order).unwrap();

        assert_eq!(f.log.get(&xid).unwrap().unwrap().status, TransactionStatus::Committed);
        assert!(f.rm.get("orders", "o1").is_some());
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let f = fixture();
        let result: CoordinatorResult<(String, ())> = f.coordinator.with_transaction("ORDER1", |branch| {
            put_order(branch)?;
            Err(BranchError::protocol("-", "payment declined"))
        });

        assert!(matches!(result, Err(CoordinatorError::Protocol { .. })));
        assert_eq!(f.coordinator.active_count(), 0);
        assert!(f.rm.get("orders", "o1").is_none());
        let records = f.log.scan_pending().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_with_transaction_rolls_back_on_abort_vote() {
        let f = fixture();
        f.rm.set_faults(FaultPlan {
            vote_abort: true,
            ..FaultPlan::default()
        });

        let result = f.coordinator.with_transaction("ORDER1", put_order);
        assert!(matches!(result, Err(CoordinatorError::Protocol { .. })));
        assert_eq!(f.coordinator.active_count(), 0);
        assert!(f.rm.get("orders", "o1").is_none());
    }
}
