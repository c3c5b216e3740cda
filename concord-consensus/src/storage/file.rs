use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use concord_common::Result;

use super::{Persistence, StoreMetadata, StoredRecord};

/// One pretty-printed JSON file per key under `dir`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl Persistence for FileStore {
    fn store(&mut self, key: &str, value: Value, metadata: StoreMetadata) -> Result<()> {
        let path = self.path_for(key);
        let revision = self.retrieve(key)?.map_or(1, |r| r.revision + 1);
        let record = StoredRecord {
            key: key.to_string(),
            value,
            metadata,
            revision,
        };

        let json = serde_json::to_string_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!("Stored {} (rev {}) at {}", key, revision, path.display());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredRecord>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}
