//! Durable storage port for node state.
//!
//! Values are JSON documents keyed by a short path such as `raft/state`.
//! Writes are synchronous: a successful `store` means the value survives a
//! restart of the node.

mod file;
mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_common::{utils::time::current_time_ms, Result};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub stored_at_ms: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl StoreMetadata {
    pub fn now() -> Self {
        Self {
            stored_at_ms: current_time_ms(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: impl ToString) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
    pub metadata: StoreMetadata,
    /// Bumped on every write of the same key.
    pub revision: u64,
}

pub trait Persistence: Send {
    fn store(&mut self, key: &str, value: Value, metadata: StoreMetadata) -> Result<()>;

    fn retrieve(&self, key: &str) -> Result<Option<StoredRecord>>;
}

impl<P: Persistence + ?Sized> Persistence for Box<P> {
    fn store(&mut self, key: &str, value: Value, metadata: StoreMetadata) -> Result<()> {
        (**self).store(key, value, metadata)
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredRecord>> {
        (**self).retrieve(key)
    }
}
