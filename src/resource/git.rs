//! Resource manager over a git document store.
//!
//! Each branch writes to `tx/{xid}`, forked from `main` at begin. Prepare
//! checks the branch against `main` and every other prepared change-set,
//! then stages the writes as one commit on top of `main`, referenced by
//! `prepared/{xid}`. Commit replays the staged commit onto the current
//! `main` and moves `main` with compare-and-swap. Rollback drops the refs.
//!
//! Prepared change-sets never overlap, so publishing one can not invalidate
//! another, and a prepared branch always commits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::resource::error::{BranchError, BranchResult};
use crate::resource::{BranchState, ResourceManager, TransactionBranch, Vote};
use crate::storage::{
    BranchName, CollectionName, CommitId, CommitMessage, Document, DocumentKey, GitRepository,
    StorageError,
};

const MAX_PUBLISH_ATTEMPTS: usize = 8;

/// Shared handle to a git-backed participant; clones share the store.
#[derive(Debug, Clone)]
pub struct GitResourceManager {
    name: String,
    repo: GitRepository,
    /// held while a change-set is checked and staged
    stage_lock: Arc<Mutex<()>>,
}

impl GitResourceManager {
    pub fn new(name: impl Into<String>, repo: GitRepository) -> Self {
        Self {
            name: name.into(),
            repo,
            stage_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the store at `path`, creating it if needed.
    pub fn open_or_init(name: impl Into<String>, path: impl AsRef<Path>) -> BranchResult<Self> {
        let name = name.into();
        let repo = GitRepository::open_or_init(path.as_ref())?;
        info!(rm = %name, path = %path.as_ref().display(), "resource manager opened");
        Ok(Self::new(name, repo))
    }

    pub fn repository(&self) -> &GitRepository {
        &self.repo
    }

    /// Committed copy of a document.
    pub fn get(
        &self,
        collection: &CollectionName,
        key: &DocumentKey,
    ) -> BranchResult<Option<Document>> {
        Ok(self.repo.read_document(collection, key, self.repo.head()?)?)
    }

    /// The commit on `main` that published this xid, if any.
    fn published_on_main(&self, xid: &str) -> BranchResult<Option<CommitId>> {
        let marker = CommitMessage::commit(xid);
        Ok(self
            .repo
            .history(self.repo.head()?, None)?
            .into_iter()
            .find(|commit| commit.summary() == marker)
            .map(|commit| commit.id))
    }

    fn unreachable(&self) -> BranchError {
        BranchError::connection(
            &self.name,
            format!("store missing at {}", self.repo.path().display()),
        )
    }
}

impl ResourceManager for GitResourceManager {
    type Branch = GitBranch;

    fn name(&self) -> &str {
        &self.name
    }

    fn is_reachable(&self) -> bool {
        self.repo.path().exists()
    }

    fn connect(&self) -> BranchResult<GitBranch> {
        if !self.is_reachable() {
            return Err(self.unreachable());
        }
        Ok(GitBranch {
            rm: self.clone(),
            xid: None,
            state: BranchState::Idle,
        })
    }

    fn attach(&self, xid: &str) -> BranchResult<GitBranch> {
        if !self.is_reachable() {
            return Err(self.unreachable());
        }

        // a published xid may still have a leftover tx ref, so the marker
        // on main is checked before the branch ref
        let state = if self.repo.branch_exists(&BranchName::for_prepared(xid))? {
            BranchState::Prepared
        } else if self.published_on_main(xid)?.is_some() {
            BranchState::Committed
        } else if self.repo.branch_exists(&BranchName::for_transaction(xid))? {
            BranchState::Active
        } else {
            return Err(BranchError::NotFound(xid.to_string()));
        };

        debug!(rm = %self.name, xid, %state, "attached to branch");
        Ok(GitBranch {
            rm: self.clone(),
            xid: Some(xid.to_string()),
            state,
        })
    }

    fn recover(&self) -> BranchResult<Vec<String>> {
        let mut xids: Vec<String> = self
            .repo
            .list_branches(Some(BranchName::PREPARED_PREFIX))?
            .iter()
            .filter_map(|branch| branch.transaction_id().map(str::to_string))
            .collect();
        xids.sort();
        Ok(xids)
    }
}

enum Staging {
    Staged(CommitId),
    Conflict(Vec<PathBuf>),
}

/// One transaction's writes against a [`GitResourceManager`].
pub struct GitBranch {
    rm: GitResourceManager,
    xid: Option<String>,
    state: BranchState,
}

impl GitBranch {
    fn active_xid(&self) -> BranchResult<&str> {
        match (self.state, self.xid.as_deref()) {
            (BranchState::Active, Some(xid)) => Ok(xid),
            (state, xid) => Err(BranchError::protocol(
                xid.unwrap_or("-"),
                format!("branch is {}, not active", state),
            )),
        }
    }

    fn bound_xid(&self) -> BranchResult<String> {
        self.xid
            .clone()
            .ok_or_else(|| BranchError::NotFound("branch was never begun".to_string()))
    }

    // ==================== Local writes ====================

    pub fn insert(&mut self, collection: &CollectionName, doc: Document) -> BranchResult<()> {
        let xid = self.active_xid()?;
        self.rm
            .repo
            .insert_document(&BranchName::for_transaction(xid), collection, doc, Some(xid))?;
        Ok(())
    }

    pub fn upsert(&mut self, collection: &CollectionName, doc: Document) -> BranchResult<()> {
        let xid = self.active_xid()?;
        self.rm
            .repo
            .upsert_document(&BranchName::for_transaction(xid), collection, doc, Some(xid))?;
        Ok(())
    }

    pub fn delete(&mut self, collection: &CollectionName, key: &DocumentKey) -> BranchResult<()> {
        let xid = self.active_xid()?;
        self.rm
            .repo
            .delete_document(&BranchName::for_transaction(xid), collection, key, Some(xid))?;
        Ok(())
    }

    /// Read through the branch, seeing its own uncommitted writes.
    pub fn get(
        &self,
        collection: &CollectionName,
        key: &DocumentKey,
    ) -> BranchResult<Option<Document>> {
        let xid = self.active_xid()?;
        let tip = self.rm.repo.resolve_branch(&BranchName::for_transaction(xid))?;
        Ok(self.rm.repo.read_document(collection, key, tip)?)
    }

    // ==================== Two-phase commit ====================

    fn stage(&self, xid: &str) -> BranchResult<Staging> {
        let repo = &self.rm.repo;
        let _guard = self.rm.stage_lock.lock();

        let tip = repo
            .resolve_branch(&BranchName::for_transaction(xid))
            .map_err(|e| missing(e, xid))?;
        let main_head = repo.head()?;
        let base = repo.merge_base(tip, main_head)?.ok_or_else(|| {
            StorageError::Internal(format!("{} shares no history with main", xid))
        })?;

        let conflicts = repo.detect_conflicts(tip, main_head)?;
        if !conflicts.is_empty() {
            return Ok(Staging::Conflict(conflicts));
        }

        let ours: HashSet<PathBuf> = repo.changed_paths(base, tip)?.into_iter().collect();
        for other in repo.list_branches(Some(BranchName::PREPARED_PREFIX))? {
            if other.transaction_id() == Some(xid) {
                continue;
            }
            let staged = repo.resolve_branch(&other)?;
            let parent = staged_parent(repo, staged)?;
            let overlap: Vec<PathBuf> = repo
                .changed_paths(parent, staged)?
                .into_iter()
                .filter(|path| ours.contains(path))
                .collect();
            if !overlap.is_empty() {
                return Ok(Staging::Conflict(overlap));
            }
        }

        let staged = repo.replay_onto(base, tip, main_head, CommitMessage::prepare(xid))?;
        repo.create_branch(&BranchName::for_prepared(xid), staged)?;
        Ok(Staging::Staged(staged))
    }

    fn publish(&self, xid: &str) -> BranchResult<CommitId> {
        let repo = &self.rm.repo;
        let prepared = BranchName::for_prepared(xid);
        let main = BranchName::main();

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let staged = repo.resolve_branch(&prepared).map_err(|e| missing(e, xid))?;
            let parent = staged_parent(repo, staged)?;
            let main_head = repo.head()?;

            if let Some(done) = self.published_commit(xid, main_head, parent)? {
                return Ok(done);
            }

            let candidate = repo.replay_onto(parent, staged, main_head, CommitMessage::commit(xid))?;
            match repo.update_branch_if_unchanged(&main, main_head, candidate) {
                Ok(()) => return Ok(candidate),
                Err(StorageError::ConcurrentModification { .. }) => {
                    debug!(xid, attempt, "main moved while publishing, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::ConcurrentModification {
            branch: main.to_string(),
        }
        .into())
    }

    /// The commit on `main` that already carries this xid's writes.
    fn published_commit(
        &self,
        xid: &str,
        main_head: CommitId,
        since: CommitId,
    ) -> BranchResult<Option<CommitId>> {
        let marker = CommitMessage::commit(xid);
        for commit in self.rm.repo.history(main_head, None)? {
            if commit.id == since {
                break;
            }
            if commit.summary() == marker {
                return Ok(Some(commit.id));
            }
        }
        Ok(None)
    }

    fn drop_refs(&self, xid: &str) -> BranchResult<()> {
        for branch in [BranchName::for_prepared(xid), BranchName::for_transaction(xid)] {
            match self.rm.repo.delete_branch(&branch) {
                Ok(()) | Err(StorageError::RefNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl TransactionBranch for GitBranch {
    fn xid(&self) -> Option<&str> {
        self.xid.as_deref()
    }

    fn state(&self) -> BranchState {
        self.state
    }

    fn begin(&mut self, xid: &str) -> BranchResult<()> {
        if self.state != BranchState::Idle {
            return Err(BranchError::protocol(xid, format!("branch is already {}", self.state)));
        }
        DocumentKey::new(xid).map_err(|e| BranchError::protocol(xid, e.to_string()))?;
        if !self.rm.is_reachable() {
            return Err(self.rm.unreachable());
        }

        let repo = &self.rm.repo;
        let base = repo.head()?;
        match repo.create_branch(&BranchName::for_transaction(xid), base) {
            Ok(()) => {}
            Err(StorageError::BranchAlreadyExists(_)) => {
                return Err(BranchError::protocol(xid, "xid already has a branch"));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(rm = %self.rm.name, xid, base = %base.short(), "branch begun");
        self.xid = Some(xid.to_string());
        self.state = BranchState::Active;
        Ok(())
    }

    fn prepare(&mut self) -> BranchResult<Vote> {
        let xid = self.bound_xid()?;
        match self.state {
            BranchState::Active => {}
            BranchState::Prepared => return Ok(Vote::Commit),
            state => {
                return Err(BranchError::protocol(xid, format!("cannot prepare, branch is {}", state)))
            }
        }

        match self.stage(&xid)? {
            Staging::Staged(staged) => {
                debug!(rm = %self.rm.name, xid = %xid, staged = %staged.short(), "branch prepared");
                self.state = BranchState::Prepared;
                Ok(Vote::Commit)
            }
            Staging::Conflict(paths) => {
                warn!(rm = %self.rm.name, xid = %xid, conflicts = paths.len(), "voting abort");
                Ok(Vote::Abort)
            }
        }
    }

    fn commit(&mut self) -> BranchResult<()> {
        let xid = self.bound_xid()?;
        match self.state {
            BranchState::Committed => return self.drop_refs(&xid),
            BranchState::Prepared => {}
            BranchState::Active => {
                if let Staging::Conflict(paths) = self.stage(&xid)? {
                    return Err(BranchError::Conflict { xid, paths });
                }
                self.state = BranchState::Prepared;
            }
            state => {
                return Err(BranchError::protocol(xid, format!("cannot commit, branch is {}", state)))
            }
        }

        let published = self.publish(&xid)?;
        self.drop_refs(&xid)?;
        self.state = BranchState::Committed;
        info!(rm = %self.rm.name, xid = %xid, commit = %published.short(), "branch committed");
        Ok(())
    }

    fn rollback(&mut self) -> BranchResult<()> {
        let xid = self.bound_xid()?;
        match self.state {
            BranchState::RolledBack => return Ok(()),
            BranchState::Active => {}
            BranchState::Prepared => {
                let repo = &self.rm.repo;
                if let Ok(staged) = repo.resolve_branch(&BranchName::for_prepared(&xid)) {
                    let parent = staged_parent(repo, staged)?;
                    if self.published_commit(&xid, repo.head()?, parent)?.is_some() {
                        self.state = BranchState::Committed;
                        return Err(BranchError::protocol(xid, "writes already published to main"));
                    }
                }
            }
            state => {
                return Err(BranchError::protocol(xid, format!("cannot roll back, branch is {}", state)))
            }
        }

        self.drop_refs(&xid)?;
        self.state = BranchState::RolledBack;
        info!(rm = %self.rm.name, xid = %xid, "branch rolled back");
        Ok(())
    }
}

fn staged_parent(repo: &GitRepository, staged: CommitId) -> BranchResult<CommitId> {
    repo.get_commit(staged)?
        .parent_ids
        .first()
        .copied()
        .ok_or_else(|| StorageError::Internal(format!("staged commit {} has no parent", staged)).into())
}

fn missing(err: StorageError, xid: &str) -> BranchError {
    match err {
        StorageError::RefNotFound(_) => BranchError::NotFound(xid.to_string()),
        other => other.into(),
    }
}
