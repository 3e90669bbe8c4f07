//! Delta-feed listing of everything under a prefix.

use backup_cloud_core::{RemoteObject, StorageError};
use tracing::{debug, info, instrument};

use crate::client::{dropbox_path, has_summary, DropboxClient};
use crate::types::{
    CreateFolderArg, FileMetadata, ListFolderArg, ListFolderContinueArg, ListFolderResult,
    Metadata,
};

/// Path of `display` relative to the lower-cased `prefix` segments, if it
/// lies strictly below them.
fn relative_to(prefix: &[String], display: &str) -> Option<String> {
    let segments: Vec<&str> = display.trim_start_matches('/').split('/').collect();
    if segments.len() <= prefix.len() {
        return None;
    }
    let inside = segments
        .iter()
        .zip(prefix)
        .all(|(segment, expected)| segment.to_lowercase() == *expected);
    inside.then(|| segments[prefix.len()..].join("/"))
}

impl DropboxClient {
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StorageError> {
        let root = dropbox_path(prefix);
        let root_ref = root.as_str();
        let label = format!("Listing of '{}'", root);

        let first = self
            .retry
            .run(&label, move || async move {
                self.rpc::<_, ListFolderResult>(
                    "files/list_folder",
                    &ListFolderArg {
                        path: root_ref,
                        recursive: true,
                    },
                )
                .await
            })
            .await;

        let mut page = match first {
            Ok(page) => page,
            Err(e) if has_summary(&e, "path/not_found") => {
                self.create_folder(&root).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        loop {
            files.extend(page.entries.into_iter().filter_map(|entry| match entry {
                Metadata::File(file) => Some(file),
                Metadata::Folder | Metadata::Deleted => None,
            }));
            if !page.has_more {
                break;
            }

            let cursor = page.cursor;
            let cursor_ref = cursor.as_str();
            page = self
                .retry
                .run(&label, move || async move {
                    self.rpc::<_, ListFolderResult>(
                        "files/list_folder/continue",
                        &ListFolderContinueArg { cursor: cursor_ref },
                    )
                    .await
                })
                .await?;
        }

        let prefix_segments: Vec<String> = root
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut objects = Vec::with_capacity(files.len());
        for file in files {
            let Some(display) = file.path_display.clone().or_else(|| file.path_lower.clone())
            else {
                continue;
            };
            let Some(relative_path) = relative_to(&prefix_segments, &display) else {
                continue;
            };
            let content_hash = self.content_hash_of(&display, &file).await;
            objects.push(RemoteObject {
                identity: display,
                relative_path,
                content_hash,
            });
        }

        debug!("Listed {} file(s) under '{}'", objects.len(), root);
        Ok(objects)
    }

    /// Hash carried by the feed, or the cached one recorded for the same
    /// revision.
    async fn content_hash_of(&self, path: &str, file: &FileMetadata) -> Option<String> {
        if file.content_hash.is_some() {
            return file.content_hash.clone();
        }
        let cached = self.metadata.get(path).await?;
        match (&cached.rev, &file.rev) {
            (Some(cached_rev), Some(rev)) if cached_rev == rev => cached.content_hash,
            _ => None,
        }
    }

    async fn create_folder(&self, path: &str) -> Result<(), StorageError> {
        let label = format!("Creation of folder '{}'", path);
        let result = self
            .retry
            .run(&label, move || async move {
                self.rpc::<_, serde::de::IgnoredAny>(
                    "files/create_folder_v2",
                    &CreateFolderArg {
                        path,
                        autorename: false,
                    },
                )
                .await
                .map(|_| ())
            })
            .await;

        match result {
            Ok(()) => {
                info!("Created Dropbox folder '{}'", path);
                Ok(())
            }
            // Created concurrently by someone else.
            Err(e) if has_summary(&e, "path/conflict") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::setup;
    use backup_cloud_core::CachedMetadata;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_relative_to() {
        let prefix = vec!["backups".to_string(), "daily".to_string()];
        assert_eq!(
            relative_to(&prefix, "/Backups/Daily/Sub/A.tar").as_deref(),
            Some("Sub/A.tar")
        );
        assert_eq!(relative_to(&prefix, "/backups/daily"), None);
        assert_eq!(relative_to(&prefix, "/backups/weekly/a.tar"), None);
        assert_eq!(relative_to(&[], "/a.tar").as_deref(), Some("a.tar"));
    }

    #[tokio::test]
    async fn test_list_follows_cursor_and_fills_hash_from_cache() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        client
            .metadata
            .put(
                "/backups/daily/b.tar",
                CachedMetadata {
                    content_hash: Some("cached-b".into()),
                    rev: Some("rev-b".into()),
                    id: None,
                },
            )
            .await
            .unwrap();
        client
            .metadata
            .put(
                "/backups/daily/c.tar",
                CachedMetadata {
                    content_hash: Some("stale-c".into()),
                    rev: Some("rev-old".into()),
                    id: None,
                },
            )
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .and(body_json(serde_json::json!({"path": "/backups/daily", "recursive": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [
                    {".tag": "folder", "name": "daily", "path_lower": "/backups/daily",
                     "path_display": "/Backups/daily"},
                    {".tag": "file", "name": "A.tar", "path_lower": "/backups/daily/a.tar",
                     "path_display": "/Backups/daily/A.tar", "id": "id:a", "rev": "rev-a",
                     "size": 3, "content_hash": "hash-a"},
                    {".tag": "deleted", "name": "gone.tar", "path_lower": "/backups/daily/gone.tar"}
                ],
                "cursor": "cursor-1",
                "has_more": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .and(body_json(serde_json::json!({"cursor": "cursor-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [
                    {".tag": "file", "name": "b.tar", "path_lower": "/backups/daily/b.tar",
                     "path_display": "/Backups/daily/b.tar", "id": "id:b", "rev": "rev-b",
                     "size": 3},
                    {".tag": "file", "name": "c.tar", "path_lower": "/backups/daily/c.tar",
                     "path_display": "/Backups/daily/c.tar", "id": "id:c", "rev": "rev-new",
                     "size": 3}
                ],
                "cursor": "cursor-2",
                "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let objects = client.list("/backups/daily/").await.unwrap();
        assert_eq!(
            objects,
            vec![
                RemoteObject {
                    identity: "/Backups/daily/A.tar".into(),
                    relative_path: "A.tar".into(),
                    content_hash: Some("hash-a".into()),
                },
                RemoteObject {
                    identity: "/Backups/daily/b.tar".into(),
                    relative_path: "b.tar".into(),
                    content_hash: Some("cached-b".into()),
                },
                RemoteObject {
                    identity: "/Backups/daily/c.tar".into(),
                    relative_path: "c.tar".into(),
                    content_hash: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_folder_is_created_and_listed_empty() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error_summary": "path/not_found/...",
                "error": {".tag": "path", "path": {".tag": "not_found"}}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/create_folder_v2"))
            .and(body_json(serde_json::json!({"path": "/backups", "autorename": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"name": "backups", "path_lower": "/backups", "id": "id:f"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client.list("backups").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [], "cursor": "c", "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client.list("backups").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_carry_operation_label() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        match client.list("backups").await.unwrap_err() {
            StorageError::RetriesExhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "Listing of '/backups'");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }
}
