//! Branch and reference management.
//!
//! Refs used by the store:
//! - `main`: the committed state
//! - `tx/{xid}`: a participant's in-flight local writes
//! - `prepared/{xid}`: the staged change-set of a prepared branch

use git2::{BranchType, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId};

pub struct RefManager;

impl RefManager {
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
        let reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    pub fn create_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(StorageError::BranchAlreadyExists(branch.to_string()));
        }

        let commit = repo.find_commit(target.raw())?;
        repo.branch(branch.as_str(), &commit, false)?;
        Ok(())
    }

    /// Force-move a branch. Prefer `update_branch_if_unchanged`.
    pub fn update_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        reference.set_target(target.raw(), &format!("move {} to {}", branch, target.short()))?;
        Ok(())
    }

    /// Compare-and-swap a branch tip.
    pub fn update_branch_if_unchanged(
        repo: &Repository,
        branch: &BranchName,
        expected: CommitId,
        new_target: CommitId,
    ) -> StorageResult<()> {
        let current = Self::resolve_branch(repo, branch)?;

        if current != expected {
            return Err(StorageError::ConcurrentModification {
                branch: branch.to_string(),
            });
        }

        Self::update_branch(repo, branch, new_target)
    }

    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        let mut git_branch = repo
            .find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        git_branch.delete()?;
        Ok(())
    }

    pub fn list_branches(repo: &Repository, prefix: Option<&str>) -> StorageResult<Vec<BranchName>> {
        let mut result = Vec::new();
        for branch_result in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch_result?;
            let Some(name) = branch.name()? else {
                continue;
            };
            if prefix.is_some_and(|p| !name.starts_with(p)) {
                continue;
            }
            if let Ok(branch_name) = BranchName::new(name) {
                result.push(branch_name);
            }
        }

        Ok(result)
    }

    /// Make sure `main` exists and HEAD points at it.
    pub fn init_main_branch(repo: &Repository, initial_commit: CommitId) -> StorageResult<()> {
        let main = BranchName::main();

        if !Self::branch_exists(repo, &main) {
            Self::create_branch(repo, &main, initial_commit)?;
        }

        repo.set_head(&main.as_ref_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::commit::{create_initial_commit, CommitBuilder};
    use crate::storage::tree::create_initial_tree;
    use crate::storage::types::GitSignature;
    use tempfile::TempDir;

    fn setup_repo_with_commit() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let commit_id = create_initial_commit(&repo, &GitSignature::gitxa()).unwrap();
        RefManager::init_main_branch(&repo, commit_id).unwrap();
        (dir, repo, commit_id)
    }

    #[test]
    fn test_branch_lifecycle() {
        let (_dir, repo, base) = setup_repo_with_commit();
        let branch = BranchName::for_transaction("TXN_1_a");

        assert!(!RefManager::branch_exists(&repo, &branch));
        RefManager::create_branch(&repo, &branch, base).unwrap();
        assert!(RefManager::branch_exists(&repo, &branch));
        assert_eq!(RefManager::resolve_branch(&repo, &branch).unwrap(), base);

        RefManager::delete_branch(&repo, &branch).unwrap();
        assert!(!RefManager::branch_exists(&repo, &branch));
    }

    #[test]
    fn test_duplicate_branch_error() {
        let (_dir, repo, base) = setup_repo_with_commit();
        let branch = BranchName::for_prepared("TXN_1_a");

        RefManager::create_branch(&repo, &branch, base).unwrap();
        let result = RefManager::create_branch(&repo, &branch, base);
        assert!(matches!(result, Err(StorageError::BranchAlreadyExists(_))));
    }

    #[test]
    fn test_list_by_prefix() {
        let (_dir, repo, base) = setup_repo_with_commit();
        RefManager::create_branch(&repo, &BranchName::for_transaction("a"), base).unwrap();
        RefManager::create_branch(&repo, &BranchName::for_transaction("b"), base).unwrap();
        RefManager::create_branch(&repo, &BranchName::for_prepared("a"), base).unwrap();

        let tx = RefManager::list_branches(&repo, Some(BranchName::TX_PREFIX)).unwrap();
        assert_eq!(tx.len(), 2);

        let prepared = RefManager::list_branches(&repo, Some(BranchName::PREPARED_PREFIX)).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].transaction_id(), Some("a"));
    }

    #[test]
    fn test_update_branch_if_unchanged() {
        let (_dir, repo, commit1) = setup_repo_with_commit();
        let main = BranchName::main();

        let tree_id = create_initial_tree(&repo).unwrap();
        let commit2 = CommitBuilder::new(&repo)
            .tree(tree_id)
            .parent(commit1)
            .message("Second commit")
            .commit()
            .unwrap();

        RefManager::update_branch_if_unchanged(&repo, &main, commit1, commit2).unwrap();

        let result = RefManager::update_branch_if_unchanged(&repo, &main, commit1, commit2);
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
    }
}
