//! Transaction id generation.
//!
//! Xids look like `{prefix}_{unix_ms}_{random}`: the millisecond timestamp
//! and 80 random bits of a monotonic ULID, the random part as 20 hex digits.
//! Within one generator the ids are strictly increasing, so two calls in the
//! same millisecond still differ.

use std::sync::OnceLock;

use parking_lot::Mutex;
use ulid::{Generator, Ulid};

/// Thread-safe source of unique xids.
pub struct XidGenerator {
    generator: Mutex<Generator>,
}

impl XidGenerator {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }

    pub fn generate(&self, prefix: &str) -> String {
        // the monotonic generator only fails once the random part of a
        // single millisecond is exhausted
        let ulid = self
            .generator
            .lock()
            .generate()
            .unwrap_or_else(|_| Ulid::new());
        format!("{}_{}_{:020x}", prefix, ulid.timestamp_ms(), ulid.random())
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for XidGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XidGenerator").finish_non_exhaustive()
    }
}

/// Generate an xid from the process-wide generator.
pub fn generate_xid(prefix: &str) -> String {
    static GLOBAL: OnceLock<XidGenerator> = OnceLock::new();
    GLOBAL.get_or_init(XidGenerator::new).generate(prefix)
}
