use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::retry::RetryPolicy;

/// Default chunk size for chunked uploads, in MiB.
pub const DEFAULT_CHUNK_SIZE_MIB: u64 = 4;
/// Default number of attempts for every network operation.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default pause between attempts.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(30);
/// Default bounded wait for the interactive authorization step.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(180);

const MIB: u64 = 1024 * 1024;

/// Settings shared by every backend client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding the session and metadata cache files.
    pub cache_dir: PathBuf,
    /// OAuth client id of the application.
    pub api_key: String,
    /// OAuth client secret of the application.
    pub api_secret: String,
    pub chunk_size_mib: u64,
    pub max_retries: u32,
    pub retry_wait: Duration,
    pub auth_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache"),
            api_key: String::new(),
            api_secret: String::new(),
            chunk_size_mib: DEFAULT_CHUNK_SIZE_MIB,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_wait: DEFAULT_RETRY_WAIT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Chunk size in bytes; files larger than this use the chunked protocol.
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mib.max(1) * MIB
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_wait)
    }

    /// Deterministic file stem for this backend and API credential pair.
    ///
    /// Distinct API keys never share cache files.
    pub fn cache_stem(&self, backend: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(b":");
        hasher.update(self.api_secret.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}", backend, &digest[..16])
    }

    pub fn session_cache_path(&self, backend: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.session.json", self.cache_stem(backend)))
    }

    pub fn metadata_cache_path(&self, backend: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.metadata.json", self.cache_stem(backend)))
    }
}

/// Settings of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Number of concurrent upload workers; 0 runs sequentially.
    pub workers: usize,
    /// Delete remote objects that no longer exist locally.
    pub mirror: bool,
}
