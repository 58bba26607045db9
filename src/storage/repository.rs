//! Core Git repository wrapper.
//!
//! Wraps `git2::Repository` with shared access and the high-level document
//! operations used by the transaction log and the git resource manager.
//! Every write goes through [`GitRepository::commit_on_branch`], which builds
//! the new tree, commits it and moves the branch with compare-and-swap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{Repository, RepositoryInitOptions};
use parking_lot::Mutex;

use crate::storage::blob::{self, Document};
use crate::storage::commit::{self, CommitBuilder, CommitInfo, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::tree::{TreeHandle, TreeMutator};
use crate::storage::types::{
    BranchName, ChangeStatus, CollectionName, CommitId, DocumentKey, DocumentPath, GitSignature,
};

/// Shared handle to a git-backed document store.
///
/// Clone to share across threads; clones point at the same repository.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    // git2::Repository is Send but not Sync.
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
}

impl GitRepository {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo =
            Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::wrap(repo, path))
    }

    /// Initialize a new repository with an empty initial commit on `main`.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(BranchName::MAIN);
        let repo = Repository::init_opts(path, &opts)?;

        let storage = Self::wrap(repo, path);
        storage.with_repo_mut(|repo| {
            let commit_id = commit::create_initial_commit(repo, &storage.inner.signature)?;
            RefManager::init_main_branch(repo, commit_id)
        })?;

        Ok(storage)
    }

    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    fn wrap(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitRepositoryInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature: GitSignature::gitxa(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run a read-only function against the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Run a writing function against the repository.
    ///
    /// Kept separate from `with_repo` so call sites say which side they are on.
    pub fn with_repo_mut<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    // ==================== Refs ====================

    /// Tip of `main`.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.resolve_branch(&BranchName::main())
    }

    pub fn resolve_branch(&self, branch: &BranchName) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve_branch(repo, branch))
    }

    pub fn branch_exists(&self, branch: &BranchName) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(RefManager::branch_exists(repo, branch)))
    }

    pub fn create_branch(&self, branch: &BranchName, at: CommitId) -> StorageResult<()> {
        self.with_repo_mut(|repo| RefManager::create_branch(repo, branch, at))
    }

    pub fn delete_branch(&self, branch: &BranchName) -> StorageResult<()> {
        self.with_repo_mut(|repo| RefManager::delete_branch(repo, branch))
    }

    pub fn update_branch_if_unchanged(
        &self,
        branch: &BranchName,
        expected: CommitId,
        new_target: CommitId,
    ) -> StorageResult<()> {
        self.with_repo_mut(|repo| {
            RefManager::update_branch_if_unchanged(repo, branch, expected, new_target)
        })
    }

    pub fn list_branches(&self, prefix: Option<&str>) -> StorageResult<Vec<BranchName>> {
        self.with_repo(|repo| RefManager::list_branches(repo, prefix))
    }

    // ==================== Documents ====================

    pub fn read_document(
        &self,
        collection: &CollectionName,
        key: &DocumentKey,
        at: CommitId,
    ) -> StorageResult<Option<Document>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            read_from_tree(repo, &tree, collection, key)
        })
    }

    pub fn list_documents(
        &self,
        collection: &CollectionName,
        at: CommitId,
    ) -> StorageResult<Vec<DocumentKey>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            tree.list_documents(repo, collection)
        })
    }

    /// Read every document of a collection into memory.
    pub fn scan_collection(
        &self,
        collection: &CollectionName,
        at: CommitId,
    ) -> StorageResult<Vec<Document>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            let keys = tree.list_documents(repo, collection)?;

            let mut docs = Vec::with_capacity(keys.len());
            for key in keys {
                let doc = read_from_tree(repo, &tree, collection, &key)?.ok_or_else(|| {
                    StorageError::DocumentNotFound {
                        collection: collection.clone(),
                        key: key.clone(),
                    }
                })?;
                docs.push(doc);
            }
            Ok(docs)
        })
    }

    /// Apply `f` to the tree at the tip of `branch` and commit the result.
    ///
    /// The branch moves only if it still points at the tip `f` saw; another
    /// process writing the same repository surfaces as `ConcurrentModification`.
    pub fn commit_on_branch<F>(
        &self,
        branch: &BranchName,
        message: impl Into<String>,
        f: F,
    ) -> StorageResult<CommitId>
    where
        F: FnOnce(&Repository, &TreeHandle<'_>, &mut TreeMutator<'_>) -> StorageResult<()>,
    {
        let message = message.into();
        self.with_repo_mut(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;
            let mut mutator = TreeMutator::from_tree(repo, &tree)?;
            f(repo, &tree, &mut mutator)?;
            let new_tree = mutator.write()?;

            let new_commit = CommitBuilder::new(repo)
                .tree(new_tree)
                .parent(tip)
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()?;

            RefManager::update_branch_if_unchanged(repo, branch, tip, new_commit)?;
            Ok(new_commit)
        })
    }

    /// Insert a new document; fails if the key is taken.
    pub fn insert_document(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        doc: Document,
        xid: Option<&str>,
    ) -> StorageResult<CommitId> {
        let path = DocumentPath::new(collection.clone(), doc.key.clone());
        self.create_document(branch, collection, doc, CommitMessage::put(&path.to_string(), xid))
    }

    /// `insert_document` with a caller-chosen commit message.
    pub fn create_document(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        doc: Document,
        message: impl Into<String>,
    ) -> StorageResult<CommitId> {
        self.commit_on_branch(branch, message, |repo, tree, mutator| {
            if tree.document_exists(repo, collection, &doc.key)? {
                return Err(StorageError::DocumentAlreadyExists {
                    collection: collection.clone(),
                    key: doc.key.clone(),
                });
            }
            let blob_id = blob::write_blob(repo, &doc)?;
            mutator.put_document(collection, &doc.key, blob_id)
        })
    }

    /// Insert or replace a document; a replacement keeps the creation time
    /// and bumps the version of the stored copy.
    pub fn upsert_document(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        doc: Document,
        xid: Option<&str>,
    ) -> StorageResult<CommitId> {
        let path = DocumentPath::new(collection.clone(), doc.key.clone());
        self.commit_on_branch(branch, CommitMessage::put(&path.to_string(), xid), |repo, tree, mutator| {
            let doc = match read_from_tree(repo, tree, collection, &doc.key)? {
                Some(existing) => existing.with_update(doc.data),
                None => doc,
            };
            let blob_id = blob::write_blob(repo, &doc)?;
            mutator.put_document(collection, &doc.key, blob_id)
        })
    }

    pub fn delete_document(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        key: &DocumentKey,
        xid: Option<&str>,
    ) -> StorageResult<CommitId> {
        let path = DocumentPath::new(collection.clone(), key.clone());
        self.commit_on_branch(branch, CommitMessage::delete(&path.to_string(), xid), |repo, tree, mutator| {
            if !tree.document_exists(repo, collection, key)? {
                return Err(StorageError::DocumentNotFound {
                    collection: collection.clone(),
                    key: key.clone(),
                });
            }
            mutator.remove_document(collection, key)
        })
    }

    /// Read-modify-write of an existing document in one commit.
    ///
    /// `f` sees the stored copy and returns the replacement.
    pub fn update_document<F>(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        key: &DocumentKey,
        message: impl Into<String>,
        f: F,
    ) -> StorageResult<CommitId>
    where
        F: FnOnce(Document) -> StorageResult<Document>,
    {
        self.commit_on_branch(branch, message, |repo, tree, mutator| {
            let existing = read_from_tree(repo, tree, collection, key)?.ok_or_else(|| {
                StorageError::DocumentNotFound {
                    collection: collection.clone(),
                    key: key.clone(),
                }
            })?;
            let replacement = f(existing)?;
            if &replacement.key != key {
                return Err(StorageError::Internal(format!(
                    "update of {} produced key {}",
                    key, replacement.key
                )));
            }
            let blob_id = blob::write_blob(repo, &replacement)?;
            mutator.put_document(collection, key, blob_id)
        })
    }

    /// Remove several documents in a single commit. Missing keys are skipped.
    pub fn delete_documents(
        &self,
        branch: &BranchName,
        collection: &CollectionName,
        keys: &[DocumentKey],
        message: impl Into<String>,
    ) -> StorageResult<CommitId> {
        self.commit_on_branch(branch, message, |repo, tree, mutator| {
            for key in keys {
                if tree.document_exists(repo, collection, key)? {
                    mutator.remove_document(collection, key)?;
                }
            }
            Ok(())
        })
    }

    // ==================== Merging ====================

    /// Replay the changes made between `base` and `tip` on top of `onto`.
    ///
    /// The result is a single commit whose parent is `onto`; no ref moves.
    pub fn replay_onto(
        &self,
        base: CommitId,
        tip: CommitId,
        onto: CommitId,
        message: impl Into<String>,
    ) -> StorageResult<CommitId> {
        let message = message.into();
        self.with_repo_mut(|repo| {
            let changes = commit::diff_commits(repo, base, tip)?;
            let tree = commit::get_tree_at_commit(repo, onto)?;
            let mut mutator = TreeMutator::from_tree(repo, &tree)?;

            for change in changes {
                let path = DocumentPath::parse(&change.path).ok_or_else(|| {
                    StorageError::CorruptedData {
                        path: change.path.clone(),
                        reason: "change outside of a collection".to_string(),
                    }
                })?;
                match (change.status, change.blob) {
                    (ChangeStatus::Deleted, _) => {
                        mutator.remove_document(&path.collection, &path.key)?
                    }
                    (_, Some(blob_id)) => {
                        mutator.put_document(&path.collection, &path.key, blob_id)?
                    }
                    (_, None) => {
                        return Err(StorageError::Internal(format!(
                            "change without blob at {}",
                            path
                        )))
                    }
                }
            }

            let new_tree = mutator.write()?;
            CommitBuilder::new(repo)
                .tree(new_tree)
                .parent(onto)
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()
        })
    }

    pub fn merge_base(&self, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
        self.with_repo(|repo| commit::find_merge_base(repo, a, b))
    }

    /// Document paths changed between two commits.
    pub fn changed_paths(&self, old: CommitId, new: CommitId) -> StorageResult<Vec<PathBuf>> {
        self.with_repo(|repo| {
            Ok(commit::diff_commits(repo, old, new)?
                .into_iter()
                .map(|change| change.path)
                .collect())
        })
    }

    /// Paths changed both in `ours` and in `theirs` since their merge base.
    pub fn detect_conflicts(&self, ours: CommitId, theirs: CommitId) -> StorageResult<Vec<PathBuf>> {
        self.with_repo(|repo| commit::detect_conflicts(repo, ours, theirs))
    }

    // ==================== History ====================

    pub fn get_commit(&self, id: CommitId) -> StorageResult<CommitInfo> {
        self.with_repo(|repo| commit::get_commit(repo, id))
    }

    pub fn history(&self, from: CommitId, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
        self.with_repo(|repo| {
            let iter = commit::history(repo, from)?;
            match limit {
                Some(n) => iter.take(n).collect(),
                None => iter.collect(),
            }
        })
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("path", &self.inner.path)
            .finish()
    }
}

fn read_from_tree(
    repo: &Repository,
    tree: &TreeHandle<'_>,
    collection: &CollectionName,
    key: &DocumentKey,
) -> StorageResult<Option<Document>> {
    let Some(blob_id) = tree.document_blob_id(repo, collection, key)? else {
        return Ok(None);
    };
    let bytes = blob::read_blob(repo, blob_id)?;
    Ok(Some(blob::deserialize_document(&bytes, key)?))
}
