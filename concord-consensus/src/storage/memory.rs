use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use concord_common::{ConcordError, Result};

use super::{Persistence, StoreMetadata, StoredRecord};

/// Volatile store. Clones share the same map, so a test can keep a handle
/// and hand another to a node it later "restarts".
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn store(&mut self, key: &str, value: Value, metadata: StoreMetadata) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| ConcordError::Storage("memory store poisoned".to_string()))?;
        let revision = records.get(key).map_or(1, |r| r.revision + 1);
        records.insert(
            key.to_string(),
            StoredRecord {
                key: key.to_string(),
                value,
                metadata,
                revision,
            },
        );
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| ConcordError::Storage("memory store poisoned".to_string()))?;
        Ok(records.get(key).cloned())
    }
}
