//! gitxa - two-phase commit over git-backed stores
//!
//! A transaction coordinator that drives a resource manager through XA
//! style prepare and commit, with every transaction's status kept in a
//! durable log. Both the log and the bundled resource manager are git
//! repositories: each state change is a commit, so the full history of
//! every transaction is preserved in `.git/`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gitxa::resource::MemoryResourceManager;
//! use gitxa::transaction::{CoordinatorConfig, TransactionCoordinator};
//! use gitxa::txlog::GitTransactionLog;
//!
//! let log = Arc::new(GitTransactionLog::open_or_init("./xa-log").unwrap());
//! let rm = MemoryResourceManager::new("orders");
//! let coordinator = TransactionCoordinator::new(CoordinatorConfig::default(), rm, log).unwrap();
//!
//! let (xid, ()) = coordinator
//!     .with_transaction("ORDER-1", |branch| {
//!         branch.put("orders", "ORDER-1", serde_json::json!({ "amount": 100 }))
//!     })
//!     .unwrap();
//! println!("committed {}", xid);
//! ```

pub mod resource;
pub mod storage;
pub mod telemetry;
pub mod transaction;
pub mod txlog;

pub use resource::{ResourceManager, TransactionBranch, Vote};
pub use transaction::{
    CoordinatorConfig, CoordinatorError, CoordinatorResult, TransactionCoordinator,
};
pub use txlog::{TransactionLog, TransactionRecord, TransactionStatus};
