use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{DeleteTarget, RemoteObject, UploadOptions};

/// Backend-agnostic remote object store.
///
/// Implemented once per backend. Every network call made by an
/// implementation goes through its [`RetryPolicy`](crate::RetryPolicy) and
/// the lazily established session.
///
/// `objects` must be driven to completion before any concurrent
/// upload/delete phase: it establishes the session and the folder/identity
/// lookups the concurrent calls rely on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in logs and error messages.
    fn backend_name(&self) -> &'static str;

    /// Whether remote paths compare case-insensitively on this backend.
    fn case_insensitive(&self) -> bool;

    /// List every (non-folder) object under `prefix`, with paths relative
    /// to it.
    async fn objects(&self, prefix: &str) -> Result<Vec<RemoteObject>, StorageError>;

    /// Upload `local_path` to `remote_path`, recording the resulting
    /// identity in the metadata cache. The returned object's
    /// `relative_path` is `remote_path` without surrounding slashes.
    ///
    /// Safe to call concurrently for distinct destination paths.
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteObject, StorageError>;

    /// Delete objects or raw keys, dropping their metadata cache entries.
    /// Already-absent objects are not an error.
    async fn delete(&self, targets: Vec<DeleteTarget>) -> Result<(), StorageError>;

    /// Remove the container at `path`.
    async fn delete_folder(&self, path: &str) -> Result<(), StorageError>;
}
