//! Google Drive API v2 client implementing [`ObjectStore`].
//!
//! Drive has no paths: folders are resolved segment by segment, listings
//! are reconstructed from parent references, and file ids are remembered
//! per full path for updates and deletes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_cloud_core::{
    normalize_key, Authorizer, ClientConfig, DeleteTarget, MetadataCache, OAuthEndpoints,
    ObjectStore, RemoteObject, RetryPolicy, SessionManager, StorageError, UploadOptions,
};
use dashmap::DashMap;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::folders::FolderResolver;
use crate::types::FileList;

pub const BACKEND: &str = "gdrive";

const API_URL: &str = "https://www.googleapis.com/drive/v2";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v2";
const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

const LIST_FIELDS: &str = "items(id,title,mimeType,parents(id),md5Checksum),nextPageToken";
const PAGE_SIZE: &str = "1000";

/// Pause between folder lookups that came back empty.
const FOLDER_LOOKUP_PAUSE: Duration = Duration::from_secs(1);

/// OAuth endpoints of the Google installed-application flow.
pub fn oauth_endpoints() -> OAuthEndpoints {
    OAuthEndpoints {
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        authorize_params: vec![
            ("scope".to_string(), DRIVE_SCOPE.to_string()),
            ("access_type".to_string(), "offline".to_string()),
        ],
        redirect_uri: Some(OOB_REDIRECT_URI.to_string()),
    }
}

/// Map a failed response onto a [`StorageError`].
pub(crate) async fn error_for(resp: Response) -> StorageError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => {
            StorageError::Authorization(format!("Google Drive rejected the access token: {}", text))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(text),
        // Drive reports quota throttling as 403; retry it like a 429.
        StatusCode::FORBIDDEN if text.contains("ateLimitExceeded") => StorageError::Api {
            backend: BACKEND,
            status: 429,
            message: text,
        },
        _ => StorageError::Api {
            backend: BACKEND,
            status: status.as_u16(),
            message: text,
        },
    }
}

pub(crate) async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, StorageError> {
    if !resp.status().is_success() {
        return Err(error_for(resp).await);
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// First segment of a normalized path, the value of the root property.
pub(crate) fn root_of(path: &str) -> &str {
    path.split('/').next().unwrap_or_default()
}

/// Builder for [`DriveClient`].
pub struct DriveClientBuilder {
    config: ClientConfig,
    authorizer: Arc<dyn Authorizer>,
    api_url: String,
    upload_url: String,
    endpoints: OAuthEndpoints,
    chunk_size: Option<u64>,
    folder_lookup_pause: Duration,
}

impl DriveClientBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn oauth_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Override the chunk size in bytes instead of whole MiB.
    pub fn chunk_size_bytes(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    pub fn folder_lookup_pause(mut self, pause: Duration) -> Self {
        self.folder_lookup_pause = pause;
        self
    }

    pub fn build(self) -> DriveClient {
        let http = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_default();
        DriveClient {
            http,
            session: SessionManager::new(BACKEND, self.endpoints, &self.config, self.authorizer),
            metadata: MetadataCache::new(self.config.metadata_cache_path(BACKEND), false),
            retry: self.config.retry_policy(),
            chunk_size: self
                .chunk_size
                .unwrap_or_else(|| self.config.chunk_size_bytes()),
            folders: FolderResolver::new(self.folder_lookup_pause),
            ids: DashMap::new(),
            paths: DashMap::new(),
            api_url: self.api_url,
            upload_url: self.upload_url,
        }
    }
}

/// Google Drive backend.
pub struct DriveClient {
    pub(crate) http: Client,
    pub(crate) api_url: String,
    pub(crate) upload_url: String,
    pub(crate) session: SessionManager,
    pub(crate) metadata: MetadataCache,
    pub(crate) retry: RetryPolicy,
    pub(crate) chunk_size: u64,
    pub(crate) folders: FolderResolver,
    /// Full path -> file id, from listings and uploads.
    ids: DashMap<String, String>,
    /// File id -> full path.
    paths: DashMap<String, String>,
}

impl DriveClient {
    pub fn new(config: &ClientConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::builder(config, authorizer).build()
    }

    pub fn builder(config: &ClientConfig, authorizer: Arc<dyn Authorizer>) -> DriveClientBuilder {
        DriveClientBuilder {
            config: config.clone(),
            authorizer,
            api_url: API_URL.to_string(),
            upload_url: UPLOAD_URL.to_string(),
            endpoints: oauth_endpoints(),
            chunk_size: None,
            folder_lookup_pause: FOLDER_LOOKUP_PAUSE,
        }
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Request with the session's bearer token.
    pub(crate) async fn authorized(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, StorageError> {
        let token = self.session.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// One page of `files.list` for a search query.
    pub(crate) async fn list_page(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, StorageError> {
        let url = format!("{}/files", self.api_url);
        let mut params = vec![
            ("q", query),
            ("fields", LIST_FIELDS),
            ("maxResults", PAGE_SIZE),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let resp = self
            .authorized(Method::GET, &url)
            .await?
            .query(&params)
            .send()
            .await?;
        parse(resp).await
    }

    pub(crate) fn remember(&self, path: &str, id: &str) {
        if let Some(previous) = self.ids.insert(path.to_string(), id.to_string()) {
            if previous != id {
                self.paths.remove(&previous);
            }
        }
        self.paths.insert(id.to_string(), path.to_string());
    }

    pub(crate) fn forget(&self, path: &str) {
        if let Some((_, id)) = self.ids.remove(path) {
            self.paths.remove(&id);
        }
    }

    /// File id of a full path: listing index first, then the metadata cache.
    pub(crate) async fn known_id(&self, path: &str) -> Option<String> {
        if let Some(id) = self.ids.get(path).map(|id| id.value().clone()) {
            return Some(id);
        }
        self.metadata.get(path).await.and_then(|cached| cached.id)
    }

    /// Delete one item; an already-absent item is fine.
    #[instrument(skip(self), level = "debug")]
    async fn delete_item(&self, id: &str) -> Result<(), StorageError> {
        let url = format!("{}/files/{}", self.api_url, id);
        let url = url.as_str();
        let label = format!("Delete of Drive item {}", id);
        let result = self
            .retry
            .run(&label, move || async move {
                let resp = self.authorized(Method::DELETE, url).await?.send().await?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(error_for(resp).await)
                }
            })
            .await;

        match result {
            Err(StorageError::NotFound(_)) => {
                debug!("Drive item {} already absent", id);
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl ObjectStore for DriveClient {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn case_insensitive(&self) -> bool {
        false
    }

    async fn objects(&self, prefix: &str) -> Result<Vec<RemoteObject>, StorageError> {
        self.list(prefix).await
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteObject, StorageError> {
        self.upload_file(local_path, remote_path, options).await
    }

    async fn delete(&self, targets: Vec<DeleteTarget>) -> Result<(), StorageError> {
        for target in targets {
            let (id, path) = match target {
                DeleteTarget::Object(object) => {
                    let path = self
                        .paths
                        .get(&object.identity)
                        .map(|path| path.value().clone());
                    (object.identity, path)
                }
                DeleteTarget::Key(key) => {
                    let path = normalize_key(&key, false);
                    match self.known_id(&path).await {
                        Some(id) => (id, Some(path)),
                        None => {
                            debug!("No known Drive item for '{}', skipping delete", path);
                            continue;
                        }
                    }
                }
            };

            self.delete_item(&id).await?;
            match path {
                Some(path) => {
                    self.forget(&path);
                    self.metadata.delete(&path).await?;
                }
                None => {
                    self.paths.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize_key(path, false);
        if path.is_empty() {
            return Err(StorageError::Config(
                "Refusing to delete the Drive root folder".into(),
            ));
        }
        match self.resolve_folder(&path, false).await? {
            Some(id) => {
                self.delete_item(&id).await?;
                self.folders.forget(&path).await;
                Ok(())
            }
            None => {
                debug!("Drive folder '{}' does not exist", path);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use backup_cloud_core::{CachedMetadata, Credential, SessionCache};
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoPrompt;

    #[async_trait]
    impl Authorizer for NoPrompt {
        async fn prompt(&self, _message: &str) -> Result<String, StorageError> {
            Err(StorageError::Authorization("no interactive session in tests".into()))
        }
    }

    pub(crate) async fn setup(server: &MockServer) -> (DriveClient, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = ClientConfig {
            cache_dir: temp_dir.path().to_path_buf(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            max_retries: 3,
            retry_wait: Duration::ZERO,
            ..Default::default()
        };
        SessionCache::new(config.session_cache_path(BACKEND))
            .save(&Credential {
                access_token: "token".into(),
                refresh_token: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let client = DriveClient::builder(&config, Arc::new(NoPrompt))
            .api_url(format!("{}/drive/v2", server.uri()))
            .upload_url(format!("{}/upload/drive/v2", server.uri()))
            .chunk_size_bytes(4)
            .folder_lookup_pause(Duration::ZERO)
            .build();
        (client, temp_dir)
    }

    /// Folder lookup query for `title` under `parent`.
    pub(crate) fn folder_query(title: &str, parent: &str) -> String {
        format!(
            "title = '{}' and '{}' in parents and mimeType = 'application/vnd.google-apps.folder' and trashed = false",
            title, parent
        )
    }

    pub(crate) async fn mount_existing_folder(server: &MockServer, title: &str, parent: &str, id: &str) {
        Mock::given(method("GET"))
            .and(path("/drive/v2/files"))
            .and(query_param("q", folder_query(title, parent)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": id, "title": title,
                           "mimeType": "application/vnd.google-apps.folder",
                           "parents": [{"id": parent}]}]
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_oauth_endpoints() {
        let endpoints = oauth_endpoints();
        assert_eq!(endpoints.redirect_uri.as_deref(), Some(OOB_REDIRECT_URI));
        assert!(endpoints
            .authorize_params
            .contains(&("access_type".to_string(), "offline".to_string())));
    }

    #[test]
    fn test_root_of() {
        assert_eq!(root_of("backups/daily/a.tar"), "backups");
        assert_eq!(root_of("a.tar"), "a.tar");
        assert_eq!(root_of(""), "");
    }

    #[tokio::test]
    async fn test_delete_by_key_uses_cached_id_and_tolerates_missing() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;
        client
            .metadata
            .put(
                "backups/a.tar",
                CachedMetadata {
                    id: Some("file-a".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        Mock::given(method("DELETE"))
            .and(path("/drive/v2/files/file-a"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(404).set_body_string("File not found"))
            .expect(1)
            .mount(&server)
            .await;

        client
            .delete(vec!["/backups/a.tar".into(), "backups/unknown.tar".into()])
            .await
            .unwrap();
        assert!(client.metadata.get("backups/a.tar").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_listed_object_drops_index_and_cache() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;
        client.remember("backups/g1/a.tar", "file-a");
        client
            .metadata
            .put(
                "backups/g1/a.tar",
                CachedMetadata {
                    id: Some("file-a".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        Mock::given(method("DELETE"))
            .and(path("/drive/v2/files/file-a"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client
            .delete(vec![DeleteTarget::Object(RemoteObject {
                identity: "file-a".into(),
                relative_path: "a.tar".into(),
                content_hash: None,
            })])
            .await
            .unwrap();

        assert!(client.known_id("backups/g1/a.tar").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_folder_resolves_without_creating() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        mount_existing_folder(&server, "backups", "root", "f-backups").await;
        Mock::given(method("GET"))
            .and(path("/drive/v2/files"))
            .and(query_param("q", folder_query("gone", "f-backups")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v2/files"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v2/files/f-backups"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client.delete_folder("backups/gone").await.unwrap();
        client.delete_folder("backups").await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_403_is_retried() {
        let server = MockServer::start().await;
        let (client, _temp_dir) = setup(&server).await;

        Mock::given(method("DELETE"))
            .and(path("/drive/v2/files/x"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string(r#"{"error": {"errors": [{"reason": "userRateLimitExceeded"}]}}"#),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v2/files/x"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client.delete_item("x").await.unwrap();
    }
}
