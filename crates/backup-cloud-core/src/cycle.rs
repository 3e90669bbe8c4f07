use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::StorageError;
use crate::store::ObjectStore;
use crate::types::{DeleteTarget, Generation};

/// Outcome of a retention sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Ids of generations fully removed.
    pub removed: Vec<String>,
    /// Ids of generations whose removal failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Deletes old backup generations from the remote store.
pub struct Cycler {
    store: Arc<dyn ObjectStore>,
}

impl Cycler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Delete every object under `prefix`, then the container itself.
    ///
    /// An empty listing is `PackageNotFound`: the generation is recorded
    /// but nothing exists remotely. Listing creates a missing prefix
    /// folder, so that empty folder is removed before reporting.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn remove_generation(&self, prefix: &str) -> Result<(), StorageError> {
        let objects = self.store.objects(prefix).await?;
        if objects.is_empty() {
            if let Err(e) = self.store.delete_folder(prefix).await {
                warn!("Failed to remove empty folder '{}': {}", prefix, e);
            }
            return Err(StorageError::PackageNotFound(prefix.to_string()));
        }

        let count = objects.len();
        let targets = objects.into_iter().map(DeleteTarget::from).collect();
        self.store.delete(targets).await?;
        self.store.delete_folder(prefix).await?;

        info!("Removed {} object(s) and folder '{}'", count, prefix);
        Ok(())
    }

    /// Keep the newest `keep` generations of `history` (ordered oldest
    /// first) and remove the rest, oldest first.
    ///
    /// A failed generation does not stop the sweep.
    pub async fn cycle(&self, history: &[Generation], keep: usize) -> CycleReport {
        let excess = history.len().saturating_sub(keep);
        let mut report = CycleReport::default();

        for generation in &history[..excess] {
            match self.remove_generation(&generation.prefix).await {
                Ok(()) => report.removed.push(generation.id.clone()),
                Err(e) => {
                    warn!(
                        "Failed to remove generation {} at '{}': {}",
                        generation.id, generation.prefix, e
                    );
                    report.failed.push((generation.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            kept = history.len() - excess,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Retention sweep finished"
        );
        report
    }
}
