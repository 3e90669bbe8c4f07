use std::collections::HashMap;
use std::time::Duration;

use backup_cloud_core::{join_remote, normalize_key, StorageError};
use reqwest::Method;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::client::{parse, root_of, DriveClient};
use crate::types::{quote, DriveItem, NewItem, FOLDER_MIME_TYPE};

/// Id of the Drive root folder.
pub const ROOT_ID: &str = "root";

/// Lookups of an existing folder before falling back to creating it.
pub const FOLDER_LOOKUP_ATTEMPTS: u32 = 3;

/// Path -> folder id map of one client. The lock is held for a whole
/// resolution walk, so concurrent walks never create the same folder twice.
pub(crate) struct FolderResolver {
    known: Mutex<HashMap<String, String>>,
    pause: Duration,
}

impl FolderResolver {
    pub(crate) fn new(pause: Duration) -> Self {
        Self {
            known: Mutex::new(HashMap::new()),
            pause,
        }
    }

    /// Drop `path` and everything below it.
    pub(crate) async fn forget(&self, path: &str) {
        let nested = format!("{}/", path);
        self.known
            .lock()
            .await
            .retain(|known, _| known != path && !known.starts_with(&nested));
    }
}

impl DriveClient {
    /// Resolve a folder path to its id, walking one segment at a time.
    ///
    /// With `create`, missing folders are created and the result is always
    /// `Some`; otherwise a missing segment yields `None`.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn resolve_folder(
        &self,
        path: &str,
        create: bool,
    ) -> Result<Option<String>, StorageError> {
        let path = normalize_key(path, false);
        if path.is_empty() {
            return Ok(Some(ROOT_ID.to_string()));
        }
        let root = root_of(&path);

        let mut known = self.folders.known.lock().await;
        let mut parent = ROOT_ID.to_string();
        let mut current = String::new();
        for segment in path.split('/') {
            current = join_remote(&current, segment);
            if let Some(id) = known.get(&current) {
                parent = id.clone();
                continue;
            }

            let id = match self.find_folder(&parent, segment).await? {
                Some(id) => id,
                None if create => self.create_folder(&parent, segment, root).await?,
                None => return Ok(None),
            };
            known.insert(current.clone(), id.clone());
            parent = id;
        }
        Ok(Some(parent))
    }

    async fn find_folder(&self, parent: &str, title: &str) -> Result<Option<String>, StorageError> {
        let query = format!(
            "title = {} and {} in parents and mimeType = {} and trashed = false",
            quote(title),
            quote(parent),
            quote(FOLDER_MIME_TYPE)
        );
        let query = query.as_str();
        let label = format!("Lookup of Drive folder '{}'", title);

        for attempt in 1..=FOLDER_LOOKUP_ATTEMPTS {
            let page = self
                .retry
                .run(&label, move || async move { self.list_page(query, None).await })
                .await?;
            if let Some(item) = page.items.into_iter().next() {
                return Ok(Some(item.id));
            }
            if attempt < FOLDER_LOOKUP_ATTEMPTS {
                debug!(
                    attempt,
                    "Drive folder '{}' not visible under {} yet", title, parent
                );
                tokio::time::sleep(self.folders.pause).await;
            }
        }
        Ok(None)
    }

    async fn create_folder(
        &self,
        parent: &str,
        title: &str,
        root: &str,
    ) -> Result<String, StorageError> {
        let url = format!("{}/files", self.api_url);
        let url = url.as_str();
        let folder = NewItem::folder(title, parent, root);
        let folder = &folder;
        let label = format!("Creation of Drive folder '{}'", title);

        let item: DriveItem = self
            .retry
            .run(&label, move || async move {
                let resp = self
                    .authorized(Method::POST, url)
                    .await?
                    .json(folder)
                    .send()
                    .await?;
                parse(resp).await
            })
            .await?;

        info!("Created Drive folder '{}' ({}) under {}", title, item.id, parent);
        Ok(item.id)
    }
}
