use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An object found on the remote store under a listing prefix.
///
/// `identity` is backend-specific (a Dropbox path, a Drive file id) and only
/// meaningful to the backend that produced it. The sync engine compares
/// `relative_path` and `content_hash` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub identity: String,
    /// Relative to the listing prefix. Objects returned by an upload carry
    /// the normalized destination path, relative to the store root.
    pub relative_path: String,
    pub content_hash: Option<String>,
}

/// A local file to be pushed, keyed by its path relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileEntry {
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// Per-call upload options.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Content hash of the object currently stored at the destination, if
    /// any. Backends that distinguish update from create use its presence
    /// to pick the update path.
    pub remote_hash: Option<String>,
}

impl UploadOptions {
    pub fn update(remote_hash: Option<String>) -> Self {
        Self { remote_hash }
    }

    pub fn is_update(&self) -> bool {
        self.remote_hash.is_some()
    }
}

/// What to delete: a previously listed object or a raw remote path.
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    Object(RemoteObject),
    Key(String),
}

impl From<RemoteObject> for DeleteTarget {
    fn from(object: RemoteObject) -> Self {
        DeleteTarget::Object(object)
    }
}

impl From<&str> for DeleteTarget {
    fn from(key: &str) -> Self {
        DeleteTarget::Key(key.to_string())
    }
}

impl From<String> for DeleteTarget {
    fn from(key: String) -> Self {
        DeleteTarget::Key(key)
    }
}

/// Backend attributes remembered across runs for one remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// One recorded backup generation and where it lives on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub id: String,
    pub prefix: String,
}

/// Normalize a remote path into a cache/lookup key.
///
/// Strips leading and trailing slashes; lower-cases when the backend matches
/// paths case-insensitively.
pub fn normalize_key(path: &str, case_insensitive: bool) -> String {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if case_insensitive {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

/// Join a prefix and a relative path with exactly one separator.
pub fn join_remote(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else if relative.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}
