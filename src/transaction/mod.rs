//! Two-phase commit coordination.
//!
//! The coordinator assigns each transaction an xid, drives the resource
//! manager's branch through prepare and commit (or rollback), and logs every
//! status change before it becomes visible.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                     │
//! │   (xid generation, status checks, per-xid serialization)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │   Active    │       │ Transaction │       │  Resource   │
//!  │   Table     │       │     Log     │       │  Manager    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gitxa::resource::GitResourceManager;
//! use gitxa::storage::{CollectionName, Document, DocumentKey};
//! use gitxa::transaction::{CoordinatorConfig, TransactionCoordinator};
//! use gitxa::txlog::GitTransactionLog;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordinatorConfig::new().data_dir("./xa");
//! let log = Arc::new(GitTransactionLog::open_or_init(&config.log_path)?);
//! let rm = GitResourceManager::open_or_init("orders", &config.store_path)?;
//! let coordinator = TransactionCoordinator::new(config, rm, log)?;
//!
//! let tx = coordinator.start_transaction("ORDER-1")?;
//! let xid = tx.xid().to_string();
//! let orders = CollectionName::new("orders")?;
//! let doc = Document::from_value(DocumentKey::new("ORDER-1")?, serde_json::json!({ "amount": 100 }))?;
//! tx.with_branch(|branch| branch.upsert(&orders, doc))?;
//!
//! if coordinator.prepare_transaction(&xid)? {
//!     coordinator.commit_transaction(&xid)?;
//! } else {
//!     coordinator.rollback_transaction(&xid)?;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod recovery;
mod table;
mod xid;

pub use config::CoordinatorConfig;
pub use coordinator::{TransactionCoordinator, TransactionHandle};
pub use error::{CoordinatorError, CoordinatorResult};
pub use recovery::{InDoubtReport, InDoubtTransaction, RecoveryReport};
pub use xid::{generate_xid, XidGenerator};
