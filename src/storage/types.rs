//! core type-safe wrappers around git primitives for the storage layer.

use std::fmt;
use std::path::{Path, PathBuf};

use git2::Oid;
use serde::{Deserialize, Serialize};

/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected. The inner Oid is only accessible within the storage module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated collection name (a top-level directory of the store).
///
/// Valid names:
/// - 1-64 characters
/// - Alphanumeric, underscores, hyphens only
/// - Must start with a letter
///
/// Names starting with `_` are kept for repository metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let first_char = name.chars().next().ok_or(InvalidNameError::Empty)?;

        if name.len() > 64 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if !first_char.is_ascii_alphabetic() {
            return Err(InvalidNameError::InvalidStart(first_char));
        }

        validate_charset(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated document key.
///
/// Keys are used as file names (`{key}.json`), so they are limited to the
/// same safe character set as collection names. Transaction ids are stored
/// under their own value, which is why the limit matches the xid width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub const MAX_LEN: usize = 128;

    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        if key.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if key.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(key.len()));
        }
        validate_charset(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocumentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_charset(name: &str) -> Result<(), InvalidNameError> {
    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }
    Ok(())
}

/// Full path to a document in the repository.
///
/// Format: `{collection}/{key}.json`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: CollectionName,
    pub key: DocumentKey,
}

impl DocumentPath {
    pub fn new(collection: CollectionName, key: DocumentKey) -> Self {
        Self { collection, key }
    }

    /// Parse a repository path such as `orders/o-1.json`.
    ///
    /// Returns `None` for metadata paths and anything that is not a document.
    pub fn parse(path: &Path) -> Option<Self> {
        let mut parts = path.iter();
        let collection = parts.next()?.to_str()?;
        let file = parts.next()?.to_str()?;
        if parts.next().is_some() {
            return None;
        }
        let key = file.strip_suffix(".json")?;
        Some(Self {
            collection: CollectionName::new(collection).ok()?,
            key: DocumentKey::new(key).ok()?,
        })
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.json", self.collection, self.key)
    }
}

/// a branch name, with namespaces for transaction work and prepared state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchName(String);

impl BranchName {
    pub const MAIN: &'static str = "main";

    /// prefix for branches holding a transaction's local writes
    pub const TX_PREFIX: &'static str = "tx/";

    /// prefix for refs marking a staged (prepared) change-set
    pub const PREPARED_PREFIX: &'static str = "prepared/";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') {
            return Err(InvalidNameError::InvalidPath(name));
        }
        Ok(Self(name))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn for_transaction(xid: &str) -> Self {
        Self(format!("{}{}", Self::TX_PREFIX, xid))
    }

    pub fn for_prepared(xid: &str) -> Self {
        Self(format!("{}{}", Self::PREPARED_PREFIX, xid))
    }

    pub fn is_transaction_branch(&self) -> bool {
        self.0.starts_with(Self::TX_PREFIX)
    }

    /// extract the xid from a `tx/` or `prepared/` ref
    pub fn transaction_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(Self::TX_PREFIX)
            .or_else(|| self.0.strip_prefix(Self::PREPARED_PREFIX))
    }

    /// get the full ref path (e.g., "refs/heads/main")
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// git signature (author/committer info)
#[derive(Debug, Clone)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for coordinator writes
    pub fn gitxa() -> Self {
        Self::new("gitxa", "gitxa@localhost")
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::gitxa()
    }
}

/// error type for invalid names (collections, keys, branches)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// a changed path between two commits, with the blob it now points to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub status: ChangeStatus,
    /// new blob for added/modified entries, `None` for deletions
    pub blob: Option<BlobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Deleted,
    Modified,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_valid() {
        assert!(CollectionName::new("orders").is_ok());
        assert!(CollectionName::new("xa_transactions").is_ok());
        assert!(CollectionName::new("Payments2").is_ok());
        assert!(CollectionName::new("my-collection").is_ok());
    }

    #[test]
    fn test_collection_name_invalid() {
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("123orders").is_err());
        assert!(CollectionName::new("_meta").is_err());
        assert!(CollectionName::new("orders/admin").is_err());
        assert!(CollectionName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_document_key() {
        assert!(DocumentKey::new("TXN_1700000000000_0123456789abcdef0123").is_ok());
        assert!(DocumentKey::new("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(DocumentKey::new("a b").is_err());
        assert!(DocumentKey::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_document_path_parse() {
        let path = DocumentPath::parse(Path::new("orders/o-1.json")).unwrap();
        assert_eq!(path.collection.as_str(), "orders");
        assert_eq!(path.key.as_str(), "o-1");
        assert_eq!(path.to_string(), "orders/o-1.json");

        assert!(DocumentPath::parse(Path::new("orders")).is_none());
        assert!(DocumentPath::parse(Path::new("_meta/x.json")).is_none());
        assert!(DocumentPath::parse(Path::new("orders/o-1.txt")).is_none());
    }

    #[test]
    fn test_branch_namespaces() {
        let tx = BranchName::for_transaction("TXN_1_a");
        assert!(tx.is_transaction_branch());
        assert_eq!(tx.transaction_id(), Some("TXN_1_a"));
        assert_eq!(tx.as_ref_path(), "refs/heads/tx/TXN_1_a");

        let prepared = BranchName::for_prepared("TXN_1_a");
        assert!(!prepared.is_transaction_branch());
        assert_eq!(prepared.transaction_id(), Some("TXN_1_a"));

        let main = BranchName::main();
        assert_eq!(main.transaction_id(), None);
        assert!(BranchName::new("../escape").is_err());
    }
}
