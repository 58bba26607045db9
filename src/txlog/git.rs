//! Transaction log kept as documents in a git repository.

use std::path::Path;

use tracing::{debug, info};

use crate::storage::{
    BranchName, CollectionName, CommitInfo, CommitMessage, Document, DocumentKey, GitRepository,
    StorageError,
};
use crate::txlog::error::{LogError, LogResult};
use crate::txlog::record::{unix_now, TransactionRecord, TransactionStatus};
use crate::txlog::{sort_records, TransactionLog};

/// Collection holding one document per xid.
pub const LOG_COLLECTION: &str = "xa_transactions";

/// Git-backed [`TransactionLog`].
///
/// Records live on `main` as `xa_transactions/{xid}.json`. Clones share the
/// same repository handle.
#[derive(Debug, Clone)]
pub struct GitTransactionLog {
    repo: GitRepository,
    collection: CollectionName,
    main: BranchName,
}

impl GitTransactionLog {
    pub fn new(repo: GitRepository) -> LogResult<Self> {
        let collection = CollectionName::new(LOG_COLLECTION).map_err(StorageError::from)?;
        Ok(Self {
            repo,
            collection,
            main: BranchName::main(),
        })
    }

    /// Open the log repository at `path`, creating it if needed.
    pub fn open_or_init(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref();
        let repo = GitRepository::open_or_init(path)?;
        info!(path = %path.display(), "transaction log opened");
        Self::new(repo)
    }

    pub fn repository(&self) -> &GitRepository {
        &self.repo
    }

    /// Commits on `main` that touched the given xid's record, newest first.
    pub fn audit_trail(&self, xid: &str) -> LogResult<Vec<CommitInfo>> {
        let history = self.repo.history(self.repo.head()?, None)?;
        Ok(history
            .into_iter()
            .filter(|commit| CommitMessage::mentions(&commit.message, xid))
            .collect())
    }

    /// Every record in the log regardless of status, oldest first.
    pub fn records(&self) -> LogResult<Vec<TransactionRecord>> {
        let docs = self.repo.scan_collection(&self.collection, self.repo.head()?)?;
        let mut records = docs
            .iter()
            .map(Document::to_typed::<TransactionRecord>)
            .collect::<Result<Vec<_>, _>>()?;
        sort_records(&mut records);
        Ok(records)
    }

    fn key(xid: &str) -> LogResult<DocumentKey> {
        Ok(DocumentKey::new(xid).map_err(StorageError::from)?)
    }
}

impl TransactionLog for GitTransactionLog {
    fn append(&self, record: &TransactionRecord) -> LogResult<()> {
        let doc = Document::from_serializable(Self::key(&record.xid)?, record)?;
        let message = CommitMessage::log_append(&record.xid, record.status.as_str());

        let result = self
            .repo
            .create_document(&self.main, &self.collection, doc, message);

        match result {
            Ok(commit) => {
                debug!(xid = %record.xid, commit = %commit.short(), "log append");
                Ok(())
            }
            Err(StorageError::DocumentAlreadyExists { .. }) => {
                Err(LogError::Duplicate(record.xid.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, xid: &str, status: TransactionStatus) -> LogResult<TransactionRecord> {
        let key = Self::key(xid)?;
        let current = self.get(xid)?.ok_or_else(|| LogError::NotFound(xid.to_string()))?;
        let next = current.advanced(status, unix_now())?;

        let message = CommitMessage::log_update(xid, current.status.as_str(), status.as_str());
        let result = self
            .repo
            .update_document(&self.main, &self.collection, &key, message, |stored| {
                let stored_record: TransactionRecord = stored.to_typed()?;
                if stored_record.status != current.status {
                    return Err(StorageError::ConcurrentModification {
                        branch: format!("{}/{}", LOG_COLLECTION, xid),
                    });
                }
                let replacement = Document::from_serializable(key.clone(), &next)?;
                Ok(stored.with_update(replacement.data))
            });

        match result {
            Ok(commit) => {
                debug!(
                    xid,
                    from = %current.status,
                    to = %status,
                    commit = %commit.short(),
                    "log update"
                );
                Ok(next)
            }
            Err(StorageError::DocumentNotFound { .. }) => Err(LogError::NotFound(xid.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, xid: &str) -> LogResult<Option<TransactionRecord>> {
        let key = Self::key(xid)?;
        let doc = self.repo.read_document(&self.collection, &key, self.repo.head()?)?;
        Ok(doc.map(|d| d.to_typed()).transpose()?)
    }

    fn scan_pending(&self) -> LogResult<Vec<TransactionRecord>> {
        let mut pending = self.records()?;
        pending.retain(|record| !record.is_terminal());
        Ok(pending)
    }

    fn purge(&self, before: u64) -> LogResult<usize> {
        let keys = self
            .records()?
            .into_iter()
            .filter(|record| record.is_terminal() && record.update_time < before)
            .map(|record| Self::key(&record.xid))
            .collect::<LogResult<Vec<_>>>()?;

        if keys.is_empty() {
            return Ok(0);
        }

        self.repo.delete_documents(
            &self.main,
            &self.collection,
            &keys,
            CommitMessage::log_purge(keys.len(), before),
        )?;
        info!(count = keys.len(), before, "purged terminal transaction records");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitTransactionLog) {
        let dir = TempDir::new().unwrap();
        let log = GitTransactionLog::open_or_init(dir.path()).unwrap();
        (dir, log)
    }

    fn record(xid: &str) -> TransactionRecord {
        TransactionRecord::started(xid, format!("ORDER-{}", xid), vec!["orders".into()])
    }

    #[test]
    fn test_append_and_get() {
        let (_dir, log) = setup();
        let rec = record("TXN_1_a");
        log.append(&rec).unwrap();

        assert_eq!(log.get("TXN_1_a").unwrap(), Some(rec));
        assert_eq!(log.get("TXN_2_b").unwrap(), None);
    }

    #[test]
    fn test_append_duplicate() {
        let (_dir, log) = setup();
        log.append(&record("TXN_1_a")).unwrap();
        let result = log.append(&record("TXN_1_a"));
        assert!(matches!(result, Err(LogError::Duplicate(_))));
    }

    #[test]
    fn test_update_moves_forward_only() {
        let (_dir, log) = setup();
        let rec = record("TXN_1_a");
        log.append(&rec).unwrap();

        let prepared = log.update("TXN_1_a", TransactionStatus::Prepared).unwrap();
        assert_eq!(prepared.status, TransactionStatus::Prepared);
        assert_eq!(prepared.create_time, rec.create_time);
        assert!(prepared.update_time >= rec.update_time);

        let result = log.update("TXN_1_a", TransactionStatus::Started);
        assert!(matches!(result, Err(LogError::InvalidTransition(_))));
        assert_eq!(
            log.get("TXN_1_a").unwrap().unwrap().status,
            TransactionStatus::Prepared
        );
    }

    #[test]
    fn test_update_unknown() {
        let (_dir, log) = setup();
        let result = log.update("TXN_1_a", TransactionStatus::Committed);
        assert!(matches!(result, Err(LogError::NotFound(_))));
    }

    #[test]
    fn test_scan_pending_excludes_terminal() {
        let (_dir, log) = setup();
        for xid in ["TXN_1_a", "TXN_1_b", "TXN_1_c"] {
            log.append(&record(xid)).unwrap();
        }
        log.update("TXN_1_b", TransactionStatus::Prepared).unwrap();
        log.update("TXN_1_c", TransactionStatus::RolledBack).unwrap();

        let pending: Vec<_> = log
            .scan_pending()
            .unwrap()
            .into_iter()
            .map(|r| (r.xid, r.status))
            .collect();
        assert_eq!(
            pending,
            vec![
                ("TXN_1_a".to_string(), TransactionStatus::Started),
                ("TXN_1_b".to_string(), TransactionStatus::Prepared),
            ]
        );
    }

    #[test]
    fn test_purge_removes_old_terminal_records() {
        let (_dir, log) = setup();
        log.append(&record("TXN_1_a")).unwrap();
        log.append(&record("TXN_1_b")).unwrap();
        log.update("TXN_1_a", TransactionStatus::Committed).unwrap();

        assert_eq!(log.purge(0).unwrap(), 0);

        let removed = log.purge(unix_now() + 10).unwrap();
        assert_eq!(removed, 1);
        assert!(log.get("TXN_1_a").unwrap().is_none());
        assert!(log.get("TXN_1_b").unwrap().is_some());
    }

    #[test]
    fn test_audit_trail_follows_xid() {
        let (_dir, log) = setup();
        log.append(&record("TXN_1_a")).unwrap();
        log.append(&record("TXN_1_b")).unwrap();
        log.update("TXN_1_a", TransactionStatus::Prepared).unwrap();
        log.update("TXN_1_a", TransactionStatus::Committed).unwrap();

        let trail = log.audit_trail("TXN_1_a").unwrap();
        let summaries: Vec<_> = trail.iter().map(|c| c.summary().to_string()).collect();
        assert_eq!(
            summaries,
            vec![
                "[LOG UPDATE] xid:TXN_1_a PREPARED -> COMMITTED",
                "[LOG UPDATE] xid:TXN_1_a STARTED -> PREPARED",
                "[LOG APPEND] xid:TXN_1_a status:STARTED",
            ]
        );
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = GitTransactionLog::open_or_init(dir.path()).unwrap();
            log.append(&record("TXN_1_a")).unwrap();
            log.update("TXN_1_a", TransactionStatus::Prepared).unwrap();
        }

        let log = GitTransactionLog::open_or_init(dir.path()).unwrap();
        let pending = log.scan_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TransactionStatus::Prepared);
    }
}
