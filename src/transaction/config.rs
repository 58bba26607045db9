//! Coordinator configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::DocumentKey;
use crate::transaction::error::{CoordinatorError, CoordinatorResult};

/// Coordinator configuration options.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```json
/// { "xid_prefix": "SHOP", "enforce_unique_order": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Prefix of generated xids.
    pub xid_prefix: String,
    /// Participant names recorded on every transaction.
    pub participants: Vec<String>,
    /// Refuse to start a second active transaction for the same order.
    pub enforce_unique_order: bool,
    /// Directory of the git transaction log.
    pub log_path: PathBuf,
    /// Directory of the git participant store.
    pub store_path: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            xid_prefix: "TXN".to_string(),
            participants: vec!["orders".to_string(), "payments".to_string()],
            enforce_unique_order: false,
            log_path: PathBuf::from(".gitxa/log"),
            store_path: PathBuf::from(".gitxa/store"),
        }
    }
}

impl CoordinatorConfig {
    /// Longest accepted prefix; keeps generated xids within key limits.
    pub const MAX_PREFIX_LEN: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> CoordinatorResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            CoordinatorError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            CoordinatorError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn xid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.xid_prefix = prefix.into();
        self
    }

    pub fn participants<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.participants = participants.into_iter().map(Into::into).collect();
        self
    }

    pub fn enforce_unique_order(mut self, value: bool) -> Self {
        self.enforce_unique_order = value;
        self
    }

    /// Put both repositories under `root` (`root/log`, `root/store`).
    pub fn data_dir(mut self, root: impl AsRef<Path>) -> Self {
        self.log_path = root.as_ref().join("log");
        self.store_path = root.as_ref().join("store");
        self
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.xid_prefix.len() > Self::MAX_PREFIX_LEN {
            return Err(CoordinatorError::InvalidConfig(format!(
                "xid prefix longer than {} characters",
                Self::MAX_PREFIX_LEN
            )));
        }
        DocumentKey::new(self.xid_prefix.as_str()).map_err(|e| {
            CoordinatorError::InvalidConfig(format!("xid prefix {:?}: {}", self.xid_prefix, e))
        })?;
        if self.participants.is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "at least one participant is required".to_string(),
            ));
        }
        Ok(())
    }
}
