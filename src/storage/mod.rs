//! Git-backed document storage.
//!
//! Both durable components of the coordinator sit on this layer: the
//! transaction log keeps its records here, and the git resource manager
//! stages participant writes on per-transaction branches. Upper layers never
//! touch git2 directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     GitRepository                           │
//! │   (documents, branches, compare-and-swap commits, replay)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │    blob     │       │    refs     │
//!  │(collections)│       │ (documents) │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │  (history)  │
//!                        └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitxa::storage::{BranchName, CollectionName, Document, DocumentKey, GitRepository};
//!
//! let repo = GitRepository::open_or_init("./store")?;
//! let orders = CollectionName::new("orders")?;
//! let doc = Document::from_value(DocumentKey::new("o-1")?, json!({"amount": 9999}))?;
//! repo.insert_document(&BranchName::main(), &orders, doc, None)?;
//! ```

mod blob;
mod commit;
mod error;
mod refs;
mod repository;
mod tree;
mod types;

pub use blob::Document;
pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use repository::GitRepository;
pub use types::{
    BlobId, BranchName, Change, ChangeStatus, CollectionName, CommitId, DocumentKey, DocumentPath,
    GitSignature, InvalidNameError, TreeId,
};
