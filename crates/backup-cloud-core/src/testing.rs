//! In-memory [`ObjectStore`] that records every call, for engine tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::store::ObjectStore;
use crate::types::{join_remote, DeleteTarget, RemoteObject, UploadOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Objects(String),
    Upload {
        local: PathBuf,
        remote: String,
        hint: Option<String>,
    },
    /// Identities of deleted objects, or raw keys.
    Delete(Vec<String>),
    DeleteFolder(String),
}

#[derive(Default)]
pub struct RecordingStore {
    case_insensitive: bool,
    listings: Mutex<HashMap<String, Vec<RemoteObject>>>,
    failing_uploads: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingStore {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            ..Default::default()
        }
    }

    pub fn set_listing(&self, prefix: &str, objects: Vec<RemoteObject>) {
        self.listings
            .lock()
            .unwrap()
            .insert(prefix.to_string(), objects);
    }

    pub fn fail_upload(&self, remote_path: &str) {
        self.failing_uploads
            .lock()
            .unwrap()
            .insert(remote_path.to_string());
    }

    pub fn fail_delete(&self, identity: &str) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(identity.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn uploaded_remote_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { remote, .. } => Some(remote),
                _ => None,
            })
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn exhausted(operation: String) -> StorageError {
        StorageError::RetriesExhausted {
            operation,
            attempts: 1,
            last_error: "injected failure".into(),
        }
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    async fn objects(&self, prefix: &str) -> Result<Vec<RemoteObject>, StorageError> {
        self.record(Call::Objects(prefix.to_string()));
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(prefix)
            .cloned()
            .unwrap_or_default())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteObject, StorageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.record(Call::Upload {
            local: local_path.to_path_buf(),
            remote: remote_path.to_string(),
            hint: options.remote_hash.clone(),
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_uploads.lock().unwrap().contains(remote_path) {
            return Err(Self::exhausted(format!("Upload of '{}'", remote_path)));
        }
        Ok(RemoteObject {
            identity: format!("id:{}", remote_path),
            relative_path: remote_path.to_string(),
            content_hash: None,
        })
    }

    async fn delete(&self, targets: Vec<DeleteTarget>) -> Result<(), StorageError> {
        let keys: Vec<String> = targets
            .into_iter()
            .map(|target| match target {
                DeleteTarget::Object(object) => object.identity,
                DeleteTarget::Key(key) => key,
            })
            .collect();
        self.record(Call::Delete(keys.clone()));

        let failing = self.failing_deletes.lock().unwrap();
        match keys.iter().find(|key| failing.contains(*key)) {
            Some(key) => Err(Self::exhausted(format!("Delete of '{}'", key))),
            None => Ok(()),
        }
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StorageError> {
        self.record(Call::DeleteFolder(path.to_string()));
        Ok(())
    }
}

/// Listing entry whose identity is derived from the full remote path.
pub fn listed(prefix: &str, relative_path: &str) -> RemoteObject {
    RemoteObject {
        identity: format!("id:{}", join_remote(prefix, relative_path)),
        relative_path: relative_path.to_string(),
        content_hash: Some(format!("hash:{}", relative_path)),
    }
}
