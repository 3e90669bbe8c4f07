//! Diff-based push of a local file set onto a remote prefix.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::StorageError;
use crate::store::ObjectStore;
use crate::types::{join_remote, DeleteTarget, LocalFileEntry, RemoteObject, UploadOptions};

/// Result of a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Neither side had any file.
    NoOp,
    Synced {
        uploaded: usize,
        /// Paths only present on the remote.
        remote_only: usize,
        /// Remote-only paths deleted in mirror mode.
        removed: usize,
    },
}

/// Decision for one path of the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upload {
        relative_path: String,
        local_path: PathBuf,
        /// Hash of the object already stored at this path, if any.
        remote_hash: Option<String>,
    },
    RemoteOnly(RemoteObject),
}

impl SyncAction {
    pub fn relative_path(&self) -> &str {
        match self {
            SyncAction::Upload { relative_path, .. } => relative_path,
            SyncAction::RemoteOnly(object) => &object.relative_path,
        }
    }
}

/// Compute the per-path actions over the union of local and remote paths,
/// sorted case-insensitively.
///
/// With `case_insensitive`, a remote path joins the union only when no local
/// path equals it ignoring case, and local paths find their remote
/// counterpart through the lower-cased key. The local casing wins.
pub fn plan(
    local: &[LocalFileEntry],
    remote: Vec<RemoteObject>,
    case_insensitive: bool,
) -> Vec<SyncAction> {
    let fold = |path: &str| {
        if case_insensitive {
            path.to_lowercase()
        } else {
            path.to_string()
        }
    };

    // One entry per folded path. Colliding local paths keep the first in
    // byte order.
    let mut ordered: Vec<&LocalFileEntry> = local.iter().collect();
    ordered.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    let mut local_files: BTreeMap<String, &LocalFileEntry> = BTreeMap::new();
    for entry in ordered {
        match local_files.entry(fold(&entry.relative_path)) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(kept) => warn!(
                "Skipping local '{}': it maps to the same remote path as '{}'",
                entry.relative_path,
                kept.get().relative_path
            ),
        }
    }

    let mut remote_files: HashMap<String, RemoteObject> = HashMap::with_capacity(remote.len());
    for object in remote {
        remote_files.insert(fold(&object.relative_path), object);
    }

    let mut actions: Vec<SyncAction> = local_files
        .iter()
        .map(|(key, entry)| SyncAction::Upload {
            relative_path: entry.relative_path.clone(),
            local_path: entry.absolute_path.clone(),
            remote_hash: remote_files
                .get(key)
                .and_then(|object| object.content_hash.clone()),
        })
        .collect();

    actions.extend(
        remote_files
            .into_iter()
            .filter(|(key, _)| !local_files.contains_key(key))
            .map(|(_, object)| SyncAction::RemoteOnly(object)),
    );

    actions.sort_by(|a, b| {
        let (a, b) = (a.relative_path(), b.relative_path());
        a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
    });
    actions
}

/// Pushes local files onto a remote prefix through an [`ObjectStore`].
pub struct Syncer {
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
}

impl Syncer {
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// List the remote prefix, then reconcile `local` against it.
    ///
    /// The listing always completes before any upload starts.
    #[instrument(skip(self, local), fields(backend = self.store.backend_name(), local = local.len()))]
    pub async fn sync(
        &self,
        local: &[LocalFileEntry],
        prefix: &str,
    ) -> Result<SyncOutcome, StorageError> {
        let remote = self.store.objects(prefix).await?;
        self.reconcile(local, remote, prefix).await
    }

    /// Reconcile `local` against an already obtained remote listing.
    pub async fn reconcile(
        &self,
        local: &[LocalFileEntry],
        remote: Vec<RemoteObject>,
        prefix: &str,
    ) -> Result<SyncOutcome, StorageError> {
        if local.is_empty() && remote.is_empty() {
            info!("Nothing to sync under '{}'", prefix);
            return Ok(SyncOutcome::NoOp);
        }

        let actions = plan(local, remote, self.store.case_insensitive());
        let mut uploads = Vec::new();
        let mut remote_only = Vec::new();
        for action in actions {
            match action {
                SyncAction::Upload {
                    relative_path,
                    local_path,
                    remote_hash,
                } => uploads.push((relative_path, local_path, remote_hash)),
                SyncAction::RemoteOnly(object) => remote_only.push(object),
            }
        }

        let uploaded = uploads.len();
        if self.config.workers > 0 {
            self.upload_concurrently(uploads, prefix).await?;
        } else {
            self.upload_sequentially(uploads, prefix).await?;
        }

        let mut removed = 0;
        if self.config.mirror && !remote_only.is_empty() {
            removed = remote_only.len();
            info!("Removing {} remote-only object(s) under '{}'", removed, prefix);
            let targets = remote_only.iter().cloned().map(DeleteTarget::from).collect();
            self.store.delete(targets).await?;
        }

        info!(
            uploaded,
            remote_only = remote_only.len(),
            removed,
            "Synced '{}' on {}",
            prefix,
            self.store.backend_name()
        );
        Ok(SyncOutcome::Synced {
            uploaded,
            remote_only: remote_only.len(),
            removed,
        })
    }

    /// Upload in sorted order, stopping at the first failure.
    async fn upload_sequentially(
        &self,
        uploads: Vec<(String, PathBuf, Option<String>)>,
        prefix: &str,
    ) -> Result<(), StorageError> {
        for (relative_path, local_path, remote_hash) in uploads {
            let remote_path = join_remote(prefix, &relative_path);
            debug!("Uploading {} -> {}", local_path.display(), remote_path);
            self.store
                .upload(&local_path, &remote_path, &UploadOptions::update(remote_hash))
                .await?;
        }
        Ok(())
    }

    /// Upload across a bounded pool. Every queued file is attempted; failed
    /// paths are reported together once the pool drains.
    async fn upload_concurrently(
        &self,
        uploads: Vec<(String, PathBuf, Option<String>)>,
        prefix: &str,
    ) -> Result<(), StorageError> {
        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for (relative_path, local_path, remote_hash) in uploads {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let remote_path = join_remote(prefix, &relative_path);
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        debug!("Uploading {} -> {}", local_path.display(), remote_path);
                        store
                            .upload(&local_path, &remote_path, &UploadOptions::update(remote_hash))
                            .await
                            .map(|_| ())
                    }
                    Err(e) => Err(StorageError::Io(format!("Worker pool closed: {}", e))),
                };
                (relative_path, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((relative_path, Err(e))) => {
                    error!("Upload of '{}' failed: {}", relative_path, e);
                    failed.push(relative_path);
                }
                Err(e) => {
                    error!("Upload worker panicked: {}", e);
                    failed.push(format!("<worker: {}>", e));
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(StorageError::SyncIncomplete(failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingStore};

    fn local(paths: &[&str]) -> Vec<LocalFileEntry> {
        paths
            .iter()
            .map(|p| LocalFileEntry {
                relative_path: p.to_string(),
                absolute_path: PathBuf::from("/src").join(p),
            })
            .collect()
    }

    fn remote(path: &str, hash: &str) -> RemoteObject {
        RemoteObject {
            identity: format!("id:{}", path),
            relative_path: path.to_string(),
            content_hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn test_plan_union_case_sensitive() {
        let actions = plan(
            &local(&["b.txt", "a.txt"]),
            vec![remote("a.txt", "h-a"), remote("c.txt", "h-c"), remote("A.txt", "h-A")],
            false,
        );

        let paths: Vec<&str> = actions.iter().map(|a| a.relative_path()).collect();
        assert_eq!(paths, vec!["A.txt", "a.txt", "b.txt", "c.txt"]);

        assert_eq!(
            actions[1],
            SyncAction::Upload {
                relative_path: "a.txt".into(),
                local_path: PathBuf::from("/src/a.txt"),
                remote_hash: Some("h-a".into()),
            }
        );
        assert!(matches!(&actions[0], SyncAction::RemoteOnly(o) if o.relative_path == "A.txt"));
        assert!(matches!(&actions[2], SyncAction::Upload { remote_hash: None, .. }));
        assert!(matches!(&actions[3], SyncAction::RemoteOnly(_)));
    }

    #[test]
    fn test_plan_folds_colliding_local_paths() {
        let actions = plan(
            &local(&["a.txt", "A.txt", "b.txt"]),
            vec![remote("a.txt", "h-a")],
            true,
        );

        assert_eq!(
            actions,
            vec![
                SyncAction::Upload {
                    relative_path: "A.txt".into(),
                    local_path: PathBuf::from("/src/A.txt"),
                    remote_hash: Some("h-a".into()),
                },
                SyncAction::Upload {
                    relative_path: "b.txt".into(),
                    local_path: PathBuf::from("/src/b.txt"),
                    remote_hash: None,
                },
            ]
        );

        // Distinct paths on a case-sensitive backend.
        let actions = plan(&local(&["a.txt", "A.txt"]), Vec::new(), false);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_plan_case_insensitive_merge_keeps_local_casing() {
        let actions = plan(
            &local(&["Docs/File.txt"]),
            vec![remote("docs/file.txt", "h1")],
            true,
        );

        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0],
            SyncAction::Upload {
                relative_path: "Docs/File.txt".into(),
                local_path: PathBuf::from("/src/Docs/File.txt"),
                remote_hash: Some("h1".into()),
            }
        );
    }

    #[test]
    fn test_plan_sorts_case_insensitively() {
        let actions = plan(&local(&["b", "C", "a"]), Vec::new(), false);
        let paths: Vec<&str> = actions.iter().map(|a| a.relative_path()).collect();
        assert_eq!(paths, vec!["a", "b", "C"]);
    }

    #[tokio::test]
    async fn test_empty_sides_are_noop_without_calls() {
        let store = Arc::new(RecordingStore::new(false));
        let syncer = Syncer::new(store.clone(), SyncConfig::default());

        let outcome = syncer.reconcile(&[], Vec::new(), "backups").await.unwrap();
        assert_eq!(outcome, SyncOutcome::NoOp);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_every_local_path_is_uploaded_with_hint() {
        let store = Arc::new(RecordingStore::new(false));
        store.set_listing(
            "backups",
            vec![remote("a.txt", "same"), remote("old.txt", "h-old")],
        );
        let syncer = Syncer::new(store.clone(), SyncConfig::default());

        let outcome = syncer
            .sync(&local(&["a.txt", "new/b.txt"]), "backups")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                uploaded: 2,
                remote_only: 1,
                removed: 0
            }
        );
        assert_eq!(
            store.calls(),
            vec![
                Call::Objects("backups".into()),
                Call::Upload {
                    local: PathBuf::from("/src/a.txt"),
                    remote: "backups/a.txt".into(),
                    hint: Some("same".into()),
                },
                Call::Upload {
                    local: PathBuf::from("/src/new/b.txt"),
                    remote: "backups/new/b.txt".into(),
                    hint: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_mirror_deletes_remote_only() {
        let store = Arc::new(RecordingStore::new(false));
        store.set_listing("backups", vec![remote("stale.txt", "h")]);
        let syncer = Syncer::new(
            store.clone(),
            SyncConfig {
                workers: 0,
                mirror: true,
            },
        );

        let outcome = syncer.sync(&local(&["kept.txt"]), "backups").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                uploaded: 1,
                remote_only: 1,
                removed: 1
            }
        );
        assert_eq!(
            store.calls().last(),
            Some(&Call::Delete(vec!["id:stale.txt".into()]))
        );
    }

    #[tokio::test]
    async fn test_sequential_aborts_on_first_failure() {
        let store = Arc::new(RecordingStore::new(false));
        store.fail_upload("backups/b.txt");
        let syncer = Syncer::new(store.clone(), SyncConfig::default());

        let err = syncer
            .sync(&local(&["a.txt", "b.txt", "c.txt"]), "backups")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RetriesExhausted { .. }));

        let uploads = store.uploaded_remote_paths();
        assert_eq!(uploads, vec!["backups/a.txt", "backups/b.txt"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_attempts_every_file_and_reports_failures() {
        let store = Arc::new(RecordingStore::new(false));
        store.fail_upload("backups/f03.bin");
        store.fail_upload("backups/f07.bin");
        let syncer = Syncer::new(
            store.clone(),
            SyncConfig {
                workers: 3,
                mirror: false,
            },
        );

        let files: Vec<String> = (0..10).map(|i| format!("f{:02}.bin", i)).collect();
        let names: Vec<&str> = files.iter().map(String::as_str).collect();
        let err = syncer.sync(&local(&names), "backups").await.unwrap_err();

        match err {
            StorageError::SyncIncomplete(failed) => {
                assert_eq!(failed, vec!["f03.bin".to_string(), "f07.bin".to_string()]);
            }
            other => panic!("expected SyncIncomplete, got {:?}", other),
        }

        let mut uploads = store.uploaded_remote_paths();
        uploads.sort();
        assert_eq!(uploads.len(), 10);
        assert_eq!(uploads[0], "backups/f00.bin");
        assert_eq!(uploads[9], "backups/f09.bin");
        assert!(store.max_in_flight() <= 3);
    }
}
