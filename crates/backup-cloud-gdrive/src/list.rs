use backup_cloud_core::{join_remote, normalize_key, RemoteObject, StorageError};
use tracing::{debug, instrument};

use crate::client::{root_of, DriveClient};
use crate::folders::ROOT_ID;
use crate::tree::reconstruct_paths;
use crate::types::{quote, ROOT_PROPERTY};

/// Items tagged with `root`, or directly inside `container`.
fn listing_query(root: &str, container: &str) -> String {
    if root.is_empty() {
        return format!("{} in parents and trashed = false", quote(container));
    }
    format!(
        "(properties has {{ key={} and value={} and visibility='PRIVATE' }} or {} in parents) and trashed = false",
        quote(ROOT_PROPERTY),
        quote(root),
        quote(container)
    )
}

impl DriveClient {
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StorageError> {
        let prefix = normalize_key(prefix, false);
        let container = self
            .resolve_folder(&prefix, true)
            .await?
            .unwrap_or_else(|| ROOT_ID.to_string());

        let query = listing_query(root_of(&prefix), &container);
        let query = query.as_str();
        let label = format!("Listing of '{}'", prefix);

        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.as_deref();
            let page = self
                .retry
                .run(&label, move || async move { self.list_page(query, token).await })
                .await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let objects: Vec<RemoteObject> = reconstruct_paths(&items, Some(&container))
            .into_iter()
            .filter(|entry| entry.anchor.as_deref() == Some(container.as_str()))
            .map(|entry| {
                self.remember(&join_remote(&prefix, &entry.path), &entry.item.id);
                RemoteObject {
                    identity: entry.item.id.clone(),
                    relative_path: entry.path,
                    content_hash: entry.item.md5_checksum.clone(),
                }
            })
            .collect();

        debug!(
            "Listed {} file(s) under '{}' from {} item(s)",
            objects.len(),
            prefix,
            items.len()
        );
        Ok(objects)
    }
}
