//! Tree operations for collection management.
//!
//! In git a tree is a directory. Here the root tree holds one directory per
//! collection and each collection directory holds `{key}.json` blobs.
//! A collection exists exactly as long as it holds at least one document.

use std::collections::HashMap;

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder as Git2TreeBuilder};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, CollectionName, DocumentKey, DocumentPath, TreeId};

/// A read-only snapshot of the tree at some commit.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// list all collections (top-level directories, metadata excluded)
    pub fn list_collections(&self) -> Vec<CollectionName> {
        self.tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Tree))
            .filter_map(|entry| CollectionName::new(entry.name()?).ok())
            .collect()
    }

    fn collection_tree<'r>(
        &self,
        repo: &'r Repository,
        collection: &CollectionName,
    ) -> StorageResult<Option<Tree<'r>>> {
        match self.tree.get_name(collection.as_str()) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::UnexpectedEntryType {
                        path: collection.as_str().into(),
                        expected: "tree (directory)".to_string(),
                        found: format!("{:?}", entry.kind()),
                    });
                }
                Ok(Some(repo.find_tree(entry.id())?))
            }
            None => Ok(None),
        }
    }

    /// list all document keys in a collection; a missing collection is empty
    pub fn list_documents(
        &self,
        repo: &Repository,
        collection: &CollectionName,
    ) -> StorageResult<Vec<DocumentKey>> {
        let Some(tree) = self.collection_tree(repo, collection)? else {
            return Ok(Vec::new());
        };

        let keys = tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Blob))
            .filter_map(|entry| {
                let key = entry.name()?.strip_suffix(".json")?;
                DocumentKey::new(key).ok()
            })
            .collect();

        Ok(keys)
    }

    pub fn document_blob_id(
        &self,
        repo: &Repository,
        collection: &CollectionName,
        key: &DocumentKey,
    ) -> StorageResult<Option<BlobId>> {
        let Some(tree) = self.collection_tree(repo, collection)? else {
            return Ok(None);
        };

        let result = match tree.get_name(&key.file_name()) {
            Some(entry) if entry.kind() == Some(ObjectType::Blob) => {
                Ok(Some(BlobId::new(entry.id())))
            }
            Some(entry) => Err(StorageError::UnexpectedEntryType {
                path: DocumentPath::new(collection.clone(), key.clone()).to_path_buf(),
                expected: "blob (file)".to_string(),
                found: format!("{:?}", entry.kind()),
            }),
            None => Ok(None),
        };
        result
    }

    pub fn document_exists(
        &self,
        repo: &Repository,
        collection: &CollectionName,
        key: &DocumentKey,
    ) -> StorageResult<bool> {
        Ok(self.document_blob_id(repo, collection, key)?.is_some())
    }
}

/// Accumulates changes against a base tree and writes a new tree.
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, &tree)?;
/// mutator.put_document(&orders, &key, blob_id)?;
/// mutator.remove_document(&payments, &old_key)?;
/// let new_tree_id = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root_builder: Git2TreeBuilder<'repo>,
    /// builders for collections touched so far
    modified: HashMap<String, Git2TreeBuilder<'repo>>,
    /// tree ids of collections present in the base tree
    original: HashMap<String, git2::Oid>,
}

impl<'repo> TreeMutator<'repo> {
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'_>) -> StorageResult<Self> {
        let root_builder = repo.treebuilder(Some(tree.inner()))?;

        let original = tree
            .inner()
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Tree))
            .filter_map(|entry| Some((entry.name()?.to_string(), entry.id())))
            .collect();

        Ok(Self {
            repo,
            root_builder,
            modified: HashMap::new(),
            original,
        })
    }

    pub fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root_builder: repo.treebuilder(None)?,
            modified: HashMap::new(),
            original: HashMap::new(),
        })
    }

    fn collection_builder(
        &mut self,
        collection: &str,
    ) -> StorageResult<&mut Git2TreeBuilder<'repo>> {
        if !self.modified.contains_key(collection) {
            let builder = match self.original.get(collection) {
                Some(id) => {
                    let tree = self.repo.find_tree(*id)?;
                    self.repo.treebuilder(Some(&tree))?
                }
                None => self.repo.treebuilder(None)?,
            };
            self.modified.insert(collection.to_string(), builder);
        }
        self.modified
            .get_mut(collection)
            .ok_or_else(|| StorageError::Internal(format!("lost builder for {}", collection)))
    }

    /// insert or replace a document, creating the collection if needed
    pub fn put_document(
        &mut self,
        collection: &CollectionName,
        key: &DocumentKey,
        blob_id: BlobId,
    ) -> StorageResult<()> {
        let builder = self.collection_builder(collection.as_str())?;
        builder.insert(key.file_name(), blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    pub fn remove_document(
        &mut self,
        collection: &CollectionName,
        key: &DocumentKey,
    ) -> StorageResult<()> {
        let builder = self.collection_builder(collection.as_str())?;
        builder
            .remove(key.file_name())
            .map_err(|_| StorageError::DocumentNotFound {
                collection: collection.clone(),
                key: key.clone(),
            })
    }

    /// write all changes and return the new root tree ID
    ///
    /// collections left without documents are dropped from the root
    pub fn write(mut self) -> StorageResult<TreeId> {
        for (name, builder) in self.modified {
            if builder.len() == 0 {
                if self.root_builder.get(name.as_str())?.is_some() {
                    self.root_builder.remove(name.as_str())?;
                }
                continue;
            }
            let tree_id = builder.write()?;
            self.root_builder.insert(name.as_str(), tree_id, FileMode::Tree.into())?;
        }

        Ok(TreeId::new(self.root_builder.write()?))
    }
}

pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    TreeMutator::empty(repo)?.write()
}
