//! Persistent state for testcase lists and stress snapshots
//!
//! Values are JSON documents keyed by a string (usually derived from the
//! active source file). The storage format behind a key is up to the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read_state(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn write_state(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// Key of the testcase list of a source file
pub fn testcases_key(file: &Path) -> String {
    format!("testcases:{}", file.display())
}

/// Key of the stress snapshot of a source file
pub fn stress_key(file: &Path) -> String {
    format!("stress:{}", file.display())
}

/// Store keeping one JSON file per key in a directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn read_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state {}", path.display()))
            }
        };
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt state file {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write_state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let data = serde_json::to_vec_pretty(&value)?;

        // temp file + rename so readers never see a half-written document
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create state dir {}", dir.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &data)?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to write state {}", path.display()))?;
            Ok(())
        })
        .await
        .context("State writer panicked")??;

        debug!("Stored state for {}", key);
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn write_state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));

        assert_eq!(store.read_state("testcases:/a.cpp").await.unwrap(), None);

        store
            .write_state("testcases:/a.cpp", json!([{"id": 1}]))
            .await
            .unwrap();
        store
            .write_state("testcases:/a.cpp", json!([{"id": 2}]))
            .await
            .unwrap();

        assert_eq!(
            store.read_state("testcases:/a.cpp").await.unwrap(),
            Some(json!([{"id": 2}]))
        );
        assert_eq!(store.read_state("testcases:/b.cpp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        std::fs::write(store.path_for("k"), "{not json").unwrap();
        assert!(store.read_state("k").await.is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        tokio_test::block_on(async {
            store.write_state("k", json!({"v": 1})).await.unwrap();
            assert_eq!(store.read_state("k").await.unwrap(), Some(json!({"v": 1})));
            assert_eq!(store.read_state("other").await.unwrap(), None);
        });
    }

    #[test]
    fn test_keys() {
        assert_eq!(testcases_key(Path::new("/p/a.cpp")), "testcases:/p/a.cpp");
        assert_eq!(stress_key(Path::new("/p/a.cpp")), "stress:/p/a.cpp");
    }
}
