use std::path::PathBuf;
use std::time::Duration;

use backup_cloud_core::{ClientConfig, SyncConfig};
use clap::{Parser, Subcommand, ValueEnum};

/// Remote store to talk to.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Dropbox,
    Gdrive,
}

/// Configuration for the backup-cloud command.
#[derive(Parser, Debug, Clone)]
#[command(name = "backup-cloud")]
#[command(about = "Push backup files to a remote store and cycle old backup generations")]
pub struct Config {
    /// Remote backend
    #[arg(long, value_enum, env = "BACKUP_CLOUD_BACKEND")]
    pub backend: Backend,

    /// Directory holding the session and metadata cache files
    #[arg(long, default_value = ".cache/backup-cloud", env = "BACKUP_CLOUD_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// OAuth client id of the registered application
    #[arg(long, env = "BACKUP_CLOUD_API_KEY")]
    pub api_key: String,

    /// OAuth client secret of the registered application
    #[arg(long, env = "BACKUP_CLOUD_API_SECRET")]
    pub api_secret: String,

    /// Files larger than this many MiB are uploaded in chunks of this size
    #[arg(long, default_value = "4", env = "BACKUP_CLOUD_CHUNK_SIZE_MIB")]
    pub chunk_size_mib: u64,

    /// Attempts per network operation
    #[arg(long, default_value = "10", env = "BACKUP_CLOUD_MAX_RETRIES")]
    pub max_retries: u32,

    /// Pause between attempts (seconds)
    #[arg(long, default_value = "30", env = "BACKUP_CLOUD_RETRY_WAIT")]
    pub retry_wait_secs: u64,

    /// How long to wait for the authorization code (seconds)
    #[arg(long, default_value = "180", env = "BACKUP_CLOUD_AUTH_TIMEOUT")]
    pub auth_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload every file under a local directory to a remote path
    Sync {
        local_dir: PathBuf,
        remote_path: String,

        /// Concurrent upload workers (0 uploads sequentially)
        #[arg(long, default_value = "0", env = "BACKUP_CLOUD_WORKERS")]
        workers: usize,

        /// Delete remote files that no longer exist locally
        #[arg(long)]
        mirror: bool,
    },
    /// Remove old backup generations, keeping the newest ones
    Cycle {
        /// Generations to keep
        #[arg(long)]
        keep: usize,

        /// Remote prefixes of the recorded generations, oldest first
        #[arg(required = true)]
        generation_prefixes: Vec<String>,
    },
}

impl Config {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            cache_dir: self.cache_dir.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            chunk_size_mib: self.chunk_size_mib,
            max_retries: self.max_retries,
            retry_wait: Duration::from_secs(self.retry_wait_secs),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
        }
    }
}

impl Command {
    pub fn sync_config(&self) -> SyncConfig {
        match self {
            Command::Sync {
                workers, mirror, ..
            } => SyncConfig {
                workers: *workers,
                mirror: *mirror,
            },
            Command::Cycle { .. } => SyncConfig::default(),
        }
    }
}
