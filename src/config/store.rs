//! Key-value configuration store
//!
//! Cluster documents are persisted externally under namespaced keys
//! (`clusters:<name>`). The store is read-only from this crate's
//! perspective. A file-backed implementation keeps one JSON document per
//! key; reads may be served from the OS page cache, which stands in for the
//! short-lived read-through cache of a remote store.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the configuration store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed document under '{0}': {1}")]
    Malformed(String, String),
}

/// Read-only key-value store for cluster documents
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the JSON document under `key`, or `None` when absent
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}

/// File-backed store: one `<key>.json` document per key under a directory
///
/// Key separators (`:`) map to `_` so keys stay single path components.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace(':', "_")))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let value = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Malformed(key.to_string(), e.to_string()))?;
        Ok(Some(value))
    }
}
