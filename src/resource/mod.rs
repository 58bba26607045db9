//! Resource managers and their transaction branches.
//!
//! A resource manager (RM) is anything that can take part in two-phase
//! commit: it hands out a [`TransactionBranch`] per transaction, and the
//! branch follows the XA call sequence
//!
//! ```text
//!  begin(xid) ──► [local writes] ──► prepare() ──► commit()
//!      │                                  │
//!      └──────────────► rollback() ◄──────┘
//! ```
//!
//! Repeating the finalize call a branch already completed succeeds; calling
//! the opposite one fails with [`BranchError::Protocol`].
//!
//! Two implementations ship with the crate:
//! - [`GitResourceManager`]: participant writes accumulate on a `tx/{xid}`
//!   branch of a git document store; prepare stages them as `prepared/{xid}`
//!   and commit publishes them to `main`.
//! - [`MemoryResourceManager`]: an in-process store with injectable faults.

mod error;
mod git;
mod memory;

use std::fmt;

pub use error::{BranchError, BranchResult};
pub use git::{GitBranch, GitResourceManager};
pub use memory::{FaultPlan, MemoryBranch, MemoryResourceManager};

/// A participant's answer to prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The branch is durable and will commit when asked.
    Commit,
    /// The branch cannot commit; the transaction must roll back.
    Abort,
}

/// Where a branch stands from the resource manager's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchState {
    /// Connected, not yet bound to an xid.
    Idle,
    Active,
    Prepared,
    Committed,
    RolledBack,
}

impl BranchState {
    pub fn is_finished(&self) -> bool {
        matches!(self, BranchState::Committed | BranchState::RolledBack)
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchState::Idle => "idle",
            BranchState::Active => "active",
            BranchState::Prepared => "prepared",
            BranchState::Committed => "committed",
            BranchState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// One transaction's work at one resource manager.
pub trait TransactionBranch: Send {
    /// The xid this branch is bound to, once begun.
    fn xid(&self) -> Option<&str>;

    fn state(&self) -> BranchState;

    /// Bind the branch to `xid` and open it for local writes.
    fn begin(&mut self, xid: &str) -> BranchResult<()>;

    /// Make the branch durable and vote.
    fn prepare(&mut self) -> BranchResult<Vote>;

    /// Publish the branch's writes. Accepted from the active state too, in
    /// which case the branch is prepared and committed in one step.
    fn commit(&mut self) -> BranchResult<()>;

    /// Discard the branch's writes, whatever phase it is in.
    fn rollback(&mut self) -> BranchResult<()>;
}

/// A participant in two-phase commit.
pub trait ResourceManager: Send + Sync {
    type Branch: TransactionBranch + 'static;

    fn name(&self) -> &str;

    fn is_reachable(&self) -> bool;

    /// A fresh, unbound branch. Fails with `Connection` when unreachable.
    fn connect(&self) -> BranchResult<Self::Branch>;

    /// Re-acquire the branch of an xid begun earlier, possibly by another
    /// process. Fails with `NotFound` if the RM has no trace of it.
    fn attach(&self, xid: &str) -> BranchResult<Self::Branch>;

    /// Xids the RM holds in the prepared state.
    fn recover(&self) -> BranchResult<Vec<String>>;
}
