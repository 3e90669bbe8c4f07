mod config;
mod console;
mod walk;

use std::sync::Arc;

use anyhow::bail;
use backup_cloud_core::{
    Authorizer, ClientConfig, Cycler, Generation, ObjectStore, SyncOutcome, Syncer,
};
use backup_cloud_dropbox::DropboxClient;
use backup_cloud_gdrive::DriveClient;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, Command, Config};
use console::ConsoleAuthorizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let client_config = config.client_config();

    info!("Starting backup-cloud ({:?})", config.backend);
    info!("  Cache directory: {}", client_config.cache_dir.display());
    info!(
        "  Retries: {} attempt(s), {} secs apart",
        client_config.max_retries,
        client_config.retry_wait.as_secs()
    );

    let store = create_store(config.backend, &client_config);
    info!("  {} backend initialized", store.backend_name());

    tokio::select! {
        result = run(store, &config.command) => result,
        _ = shutdown_signal() => bail!("Interrupted"),
    }
}

fn create_store(backend: Backend, config: &ClientConfig) -> Arc<dyn ObjectStore> {
    let authorizer: Arc<dyn Authorizer> = Arc::new(ConsoleAuthorizer);
    match backend {
        Backend::Dropbox => Arc::new(DropboxClient::new(config, authorizer)),
        Backend::Gdrive => Arc::new(DriveClient::new(config, authorizer)),
    }
}

async fn run(store: Arc<dyn ObjectStore>, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Sync {
            local_dir,
            remote_path,
            ..
        } => {
            let files = walk::collect_files(local_dir).await?;
            info!(
                "Found {} local file(s) under {}",
                files.len(),
                local_dir.display()
            );

            let syncer = Syncer::new(store, command.sync_config());
            match syncer.sync(&files, remote_path).await? {
                SyncOutcome::NoOp => info!("Nothing to sync"),
                SyncOutcome::Synced {
                    uploaded,
                    remote_only,
                    removed,
                } => info!(
                    "Sync complete: {} uploaded, {} remote-only, {} removed",
                    uploaded, remote_only, removed
                ),
            }
        }
        Command::Cycle {
            keep,
            generation_prefixes,
        } => {
            let history: Vec<Generation> = generation_prefixes
                .iter()
                .map(|prefix| Generation {
                    id: prefix.clone(),
                    prefix: prefix.clone(),
                })
                .collect();

            let report = Cycler::new(store).cycle(&history, *keep).await;
            info!(
                "Cycle complete: {} generation(s) removed, {} failed",
                report.removed.len(),
                report.failed.len()
            );
            for (id, reason) in &report.failed {
                warn!("  {} could not be removed: {}", id, reason);
            }
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, aborting");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, aborting");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
