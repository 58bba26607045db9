//! In-process resource manager with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::resource::error::{BranchError, BranchResult};
use crate::resource::{BranchState, ResourceManager, TransactionBranch, Vote};

/// Failures the memory RM should simulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// every call fails with `Connection`
    pub unreachable: bool,
    /// prepare fails with `Protocol`
    pub reject_prepare: bool,
    /// prepare answers `Vote::Abort`
    pub vote_abort: bool,
    /// commit fails with `Protocol`
    pub reject_commit: bool,
    /// rollback fails with `Protocol`
    pub reject_rollback: bool,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put {
        collection: String,
        key: String,
        value: Value,
    },
    Delete {
        collection: String,
        key: String,
    },
}

#[derive(Debug)]
struct BranchEntry {
    state: BranchState,
    writes: Vec<PendingWrite>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    name: String,
    faults: RwLock<FaultPlan>,
    branches: Mutex<HashMap<String, BranchEntry>>,
    committed: RwLock<BTreeMap<(String, String), Value>>,
}

/// A participant whose committed state is a map of `(collection, key)` to
/// JSON values. Branch states are remembered after they finish, so
/// finalize calls stay idempotent across `attach`.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceManager {
    inner: Arc<MemoryInner>,
}

impl MemoryResourceManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                ..MemoryInner::default()
            }),
        }
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *self.inner.faults.write() = faults;
    }

    pub fn faults(&self) -> FaultPlan {
        self.inner.faults.read().clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.faults.write().unreachable = !reachable;
    }

    /// Committed value of a key.
    pub fn get(&self, collection: &str, key: &str) -> Option<Value> {
        self.inner
            .committed
            .read()
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub fn committed_len(&self) -> usize {
        self.inner.committed.read().len()
    }

    pub fn branch_state(&self, xid: &str) -> Option<BranchState> {
        self.inner.branches.lock().get(xid).map(|entry| entry.state)
    }

    fn check_reachable(&self) -> BranchResult<()> {
        if self.inner.faults.read().unreachable {
            return Err(BranchError::connection(&self.inner.name, "injected outage"));
        }
        Ok(())
    }

    fn branch(&self, xid: Option<String>) -> MemoryBranch {
        MemoryBranch {
            rm: self.clone(),
            xid,
        }
    }
}

impl ResourceManager for MemoryResourceManager {
    type Branch = MemoryBranch;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_reachable(&self) -> bool {
        !self.inner.faults.read().unreachable
    }

    fn connect(&self) -> BranchResult<MemoryBranch> {
        self.check_reachable()?;
        Ok(self.branch(None))
    }

    fn attach(&self, xid: &str) -> BranchResult<MemoryBranch> {
        self.check_reachable()?;
        if !self.inner.branches.lock().contains_key(xid) {
            return Err(BranchError::NotFound(xid.to_string()));
        }
        Ok(self.branch(Some(xid.to_string())))
    }

    fn recover(&self) -> BranchResult<Vec<String>> {
        self.check_reachable()?;
        let mut xids: Vec<String> = self
            .inner
            .branches
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == BranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect();
        xids.sort();
        Ok(xids)
    }
}

/// One transaction's writes against a [`MemoryResourceManager`].
pub struct MemoryBranch {
    rm: MemoryResourceManager,
    xid: Option<String>,
}

impl MemoryBranch {
    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> BranchResult<()> {
        self.push(PendingWrite::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        })
    }

    pub fn delete(&mut self, collection: &str, key: &str) -> BranchResult<()> {
        self.push(PendingWrite::Delete {
            collection: collection.to_string(),
            key: key.to_string(),
        })
    }

    fn push(&mut self, write: PendingWrite) -> BranchResult<()> {
        let xid = self.bound_xid()?;
        let mut branches = self.rm.inner.branches.lock();
        let entry = branches
            .get_mut(&xid)
            .ok_or_else(|| BranchError::NotFound(xid.clone()))?;
        if entry.state != BranchState::Active {
            return Err(BranchError::protocol(xid, format!("branch is {}, not active", entry.state)));
        }
        entry.writes.push(write);
        Ok(())
    }

    fn bound_xid(&self) -> BranchResult<String> {
        self.xid
            .clone()
            .ok_or_else(|| BranchError::NotFound("branch was never begun".to_string()))
    }

    fn apply(&self, writes: Vec<PendingWrite>) {
        let mut committed = self.rm.inner.committed.write();
        for write in writes {
            match write {
                PendingWrite::Put {
                    collection,
                    key,
                    value,
                } => {
                    committed.insert((collection, key), value);
                }
                PendingWrite::Delete { collection, key } => {
                    committed.remove(&(collection, key));
                }
            }
        }
    }
}

impl TransactionBranch for MemoryBranch {
    fn xid(&self) -> Option<&str> {
        self.xid.as_deref()
    }

    fn state(&self) -> BranchState {
        match &self.xid {
            Some(xid) => self.rm.branch_state(xid).unwrap_or(BranchState::Idle),
            None => BranchState::Idle,
        }
    }

    fn begin(&mut self, xid: &str) -> BranchResult<()> {
        self.rm.check_reachable()?;
        if let Some(bound) = &self.xid {
            return Err(BranchError::protocol(xid, format!("branch already bound to {}", bound)));
        }

        let mut branches = self.rm.inner.branches.lock();
        if branches.contains_key(xid) {
            return Err(BranchError::protocol(xid, "xid already has a branch"));
        }
        branches.insert(
            xid.to_string(),
            BranchEntry {
                state: BranchState::Active,
                writes: Vec::new(),
            },
        );
        self.xid = Some(xid.to_string());
        Ok(())
    }

    fn prepare(&mut self) -> BranchResult<Vote> {
        self.rm.check_reachable()?;
        let xid = self.bound_xid()?;
        let faults = self.rm.faults();

        let mut branches = self.rm.inner.branches.lock();
        let entry = branches
            .get_mut(&xid)
            .ok_or_else(|| BranchError::NotFound(xid.clone()))?;
        match entry.state {
            BranchState::Active => {}
            BranchState::Prepared => return Ok(Vote::Commit),
            state => {
                return Err(BranchError::protocol(xid, format!("cannot prepare, branch is {}", state)))
            }
        }

        if faults.reject_prepare {
            return Err(BranchError::protocol(xid, "prepare rejected"));
        }
        if faults.vote_abort {
            debug!(rm = %self.rm.inner.name, xid = %xid, "voting abort");
            return Ok(Vote::Abort);
        }
        entry.state = BranchState::Prepared;
        Ok(Vote::Commit)
    }

    fn commit(&mut self) -> BranchResult<()> {
        self.rm.check_reachable()?;
        let xid = self.bound_xid()?;
        let faults = self.rm.faults();

        let writes = {
            let mut branches = self.rm.inner.branches.lock();
            let entry = branches
                .get_mut(&xid)
                .ok_or_else(|| BranchError::NotFound(xid.clone()))?;
            match entry.state {
                BranchState::Committed => return Ok(()),
                BranchState::Active | BranchState::Prepared => {}
                state => {
                    return Err(BranchError::protocol(xid, format!("cannot commit, branch is {}", state)))
                }
            }
            if faults.reject_commit {
                return Err(BranchError::protocol(xid, "commit rejected"));
            }
            entry.state = BranchState::Committed;
            std::mem::take(&mut entry.writes)
        };

        self.apply(writes);
        Ok(())
    }

    fn rollback(&mut self) -> BranchResult<()> {
        self.rm.check_reachable()?;
        let xid = self.bound_xid()?;
        let faults = self.rm.faults();

        let mut branches = self.rm.inner.branches.lock();
        let entry = branches
            .get_mut(&xid)
            .ok_or_else(|| BranchError::NotFound(xid.clone()))?;
        match entry.state {
            BranchState::RolledBack => return Ok(()),
            BranchState::Active | BranchState::Prepared => {}
            state => {
                return Err(BranchError::protocol(xid, format!("cannot roll back, branch is {}", state)))
            }
        }
        if faults.reject_rollback {
            return Err(BranchError::protocol(xid, "rollback rejected"));
        }
        entry.state = BranchState::RolledBack;
        entry.writes.clear();
        Ok(())
    }
}
