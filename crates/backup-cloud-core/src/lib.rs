//! Core traits and types for backup-cloud remote storage.
//!
//! This crate holds everything shared between the remote backends:
//! - `ObjectStore`: list, upload and delete objects under a path prefix
//! - `RetryPolicy`: fixed-pause retries around every network call
//! - `SessionManager`: lazily established, cached OAuth session
//! - `MetadataCache`: on-disk remote identity/hash cache
//! - `Syncer`: diff-based push of a local file set
//! - `Cycler`: retention of backup generations

mod config;
mod cycle;
mod error;
mod metadata;
mod retry;
mod session;
mod store;
mod sync;
mod types;

#[cfg(test)]
mod testing;

pub use config::{
    ClientConfig, SyncConfig, DEFAULT_AUTH_TIMEOUT, DEFAULT_CHUNK_SIZE_MIB, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_WAIT,
};
pub use cycle::{CycleReport, Cycler};
pub use error::{Result, StorageError};
pub use metadata::MetadataCache;
pub use retry::RetryPolicy;
pub use session::{
    Authorizer, Credential, OAuthEndpoints, Session, SessionCache, SessionManager,
};
pub use store::ObjectStore;
pub use sync::{plan, SyncAction, SyncOutcome, Syncer};
pub use types::{
    join_remote, normalize_key, CachedMetadata, DeleteTarget, Generation, LocalFileEntry,
    RemoteObject, UploadOptions,
};
