//! Commit creation and history traversal.
//!
//! Every write to the store is a commit: transaction log updates land on
//! `main` of the log repository, a participant's local writes land on its
//! `tx/{xid}` branch. The history doubles as the audit trail.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use git2::{Delta, DiffOptions, Repository, Revwalk, Sort};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::TreeHandle;
use crate::storage::types::{BlobId, Change, ChangeStatus, CommitId, GitSignature, TreeId};

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let timestamp = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            tree_id: TreeId::new(commit.tree_id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: commit.author().name().unwrap_or("unknown").to_string(),
            timestamp,
        }
    }

    /// first line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
    update_ref: Option<String>,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::gitxa(),
            update_ref: None,
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// update a ref to point to this commit
    pub fn update_ref(mut self, refname: impl Into<String>) -> Self {
        self.update_ref = Some(refname.into());
        self
    }

    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self.repo.commit(
            self.update_ref.as_deref(),
            &sig,
            &sig,
            &self.message,
            &tree,
            &parent_refs,
        )?;

        Ok(CommitId::new(oid))
    }
}

pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))?;

    Ok(CommitInfo::from_git2(&commit))
}

pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::CommitNotFound(commit_id.to_string()))?;

    Ok(TreeHandle::new(commit.tree()?))
}

pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message("[gitxa] Initialize repository")
        .signature(signature.clone())
        .update_ref("HEAD")
        .commit()
}

/// paths changed between two commits, with their new blobs
pub fn diff_commits(repo: &Repository, old: CommitId, new: CommitId) -> StorageResult<Vec<Change>> {
    let old_tree = repo.find_commit(old.raw())?.tree()?;
    let new_tree = repo.find_commit(new.raw())?.tree()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

    let changes = diff
        .deltas()
        .map(|delta| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(PathBuf::from)
                .unwrap_or_default();

            let status = match delta.status() {
                Delta::Added => ChangeStatus::Added,
                Delta::Deleted => ChangeStatus::Deleted,
                Delta::Modified => ChangeStatus::Modified,
                _ => ChangeStatus::Other,
            };

            let blob = match status {
                ChangeStatus::Deleted => None,
                _ => Some(BlobId::new(delta.new_file().id())),
            };

            Change { path, status, blob }
        })
        .collect();

    Ok(changes)
}

/// find the common ancestor of two commits
pub fn find_merge_base(repo: &Repository, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
    match repo.merge_base(a.raw(), b.raw()) {
        Ok(oid) => Ok(Some(CommitId::new(oid))),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(StorageError::Git(e)),
    }
}

pub struct HistoryIterator<'repo> {
    repo: &'repo Repository,
    revwalk: Revwalk<'repo>,
}

impl<'repo> HistoryIterator<'repo> {
    pub fn new(repo: &'repo Repository, start: CommitId) -> StorageResult<Self> {
        let mut revwalk = repo.revwalk()?;
        revwalk.push(start.raw())?;
        revwalk.set_sorting(Sort::TIME | Sort::TOPOLOGICAL)?;

        Ok(Self { repo, revwalk })
    }
}

impl Iterator for HistoryIterator<'_> {
    type Item = StorageResult<CommitInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.revwalk.next()? {
            Ok(oid) => match self.repo.find_commit(oid) {
                Ok(commit) => Some(Ok(CommitInfo::from_git2(&commit))),
                Err(e) => Some(Err(StorageError::Git(e))),
            },
            Err(e) => Some(Err(StorageError::Git(e))),
        }
    }
}

pub fn history(repo: &Repository, start: CommitId) -> StorageResult<HistoryIterator<'_>> {
    HistoryIterator::new(repo, start)
}

/// paths modified on both sides since the merge base of `ours` and `theirs`
pub fn detect_conflicts(repo: &Repository, ours: CommitId, theirs: CommitId) -> StorageResult<Vec<PathBuf>> {
    let base = find_merge_base(repo, ours, theirs)?.ok_or_else(|| {
        StorageError::Internal("no common ancestor found for conflict detection".to_string())
    })?;

    let our_changes = diff_commits(repo, base, ours)?;
    let their_changes = diff_commits(repo, base, theirs)?;

    let our_paths: HashSet<_> = our_changes.iter().map(|c| &c.path).collect();

    Ok(their_changes
        .iter()
        .filter(|c| our_paths.contains(&c.path))
        .map(|c| c.path.clone())
        .collect())
}

/// message formatting; every message names the xid it belongs to
pub struct CommitMessage;

impl CommitMessage {
    pub fn put(path: &str, xid: Option<&str>) -> String {
        match xid {
            Some(id) => format!("[PUT] {} xid:{}", path, id),
            None => format!("[PUT] {}", path),
        }
    }

    pub fn delete(path: &str, xid: Option<&str>) -> String {
        match xid {
            Some(id) => format!("[DELETE] {} xid:{}", path, id),
            None => format!("[DELETE] {}", path),
        }
    }

    pub fn log_append(xid: &str, status: &str) -> String {
        format!("[LOG APPEND] xid:{} status:{}", xid, status)
    }

    pub fn log_update(xid: &str, from: &str, to: &str) -> String {
        format!("[LOG UPDATE] xid:{} {} -> {}", xid, from, to)
    }

    pub fn log_purge(count: usize, before: u64) -> String {
        format!("[LOG PURGE] {} terminal records before {}", count, before)
    }

    pub fn prepare(xid: &str) -> String {
        format!("[PREPARE] xid:{} staged onto main", xid)
    }

    pub fn commit(xid: &str) -> String {
        format!("[COMMIT] xid:{}", xid)
    }

    /// whether a commit message belongs to the given xid
    pub fn mentions(message: &str, xid: &str) -> bool {
        message
            .split_whitespace()
            .any(|word| word.strip_prefix("xid:") == Some(xid))
    }
}
