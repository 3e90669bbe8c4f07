//! On-disk cache of remote object identity, keyed by normalized path.
//!
//! The whole document is read, mutated and rewritten under one lock per
//! cache instance; concurrent callers queue on the lock instead of racing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::types::{normalize_key, CachedMetadata};

type Document = BTreeMap<String, CachedMetadata>;

/// Metadata cache bound to one file.
#[derive(Debug)]
pub struct MetadataCache {
    path: PathBuf,
    case_insensitive: bool,
    lock: Mutex<()>,
}

impl MetadataCache {
    pub fn new(path: impl Into<PathBuf>, case_insensitive: bool) -> Self {
        Self {
            path: path.into(),
            case_insensitive,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cache key for a remote path on this backend.
    pub fn key(&self, path: &str) -> String {
        normalize_key(path, self.case_insensitive)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, path: &str) -> Option<CachedMetadata> {
        let key = self.key(path);
        let _guard = self.lock.lock().await;
        self.read_document().await.remove(&key)
    }

    #[instrument(skip(self, metadata), level = "debug")]
    pub async fn put(&self, path: &str, metadata: CachedMetadata) -> Result<(), StorageError> {
        let key = self.key(path);
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        document.insert(key, metadata);
        self.write_document(&document).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let key = self.key(path);
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        if document.remove(&key).is_none() {
            return Ok(());
        }
        self.write_document(&document).await
    }

    /// Missing or unparsable files read as an empty document.
    async fn read_document(&self) -> Document {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Document::new(),
            Err(e) => {
                warn!(
                    "Failed to read metadata cache {}: {}, starting empty",
                    self.path.display(),
                    e
                );
                return Document::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(e) => {
                warn!(
                    "Corrupt metadata cache {}: {}, starting empty",
                    self.path.display(),
                    e
                );
                Document::new()
            }
        }
    }

    /// Rewrite the whole document through a temp file and rename.
    async fn write_document(&self, document: &Document) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Io(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_vec_pretty(document)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to rename temp file to {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!(
            "Wrote metadata cache {} ({} entries)",
            self.path.display(),
            document.len()
        );
        Ok(())
    }
}
