//! Dropbox API v2 client implementing [`ObjectStore`].
//!
//! Paths on Dropbox are absolute (`/prefix/rel`) and compared
//! case-insensitively, so metadata cache keys are lower-cased.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use backup_cloud_core::{
    Authorizer, ClientConfig, DeleteTarget, MetadataCache, OAuthEndpoints, ObjectStore,
    RemoteObject, RetryPolicy, SessionManager, StorageError, UploadOptions,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::types::{ApiErrorBody, PathArg};

pub const BACKEND: &str = "dropbox";

const API_URL: &str = "https://api.dropboxapi.com";
const CONTENT_URL: &str = "https://content.dropboxapi.com";
const AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";

/// OAuth endpoints of the Dropbox app authorization flow, with the token
/// endpoint under `api_url`.
pub fn oauth_endpoints(api_url: &str) -> OAuthEndpoints {
    OAuthEndpoints {
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: format!("{}/oauth2/token", api_url.trim_end_matches('/')),
        authorize_params: vec![("token_access_type".to_string(), "offline".to_string())],
        redirect_uri: None,
    }
}

/// Dropbox path for a slash-separated remote path. The root is `""`.
pub(crate) fn dropbox_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Whether `err` is an endpoint error whose summary starts with `prefix`.
pub(crate) fn has_summary(err: &StorageError, prefix: &str) -> bool {
    matches!(
        err,
        StorageError::Api { status: 409, message, .. } if message.starts_with(prefix)
    )
}

/// JSON for the `Dropbox-API-Arg` header, with non-ASCII characters
/// escaped as the header value must be ASCII.
pub(crate) fn api_arg<A: Serialize + ?Sized>(arg: &A) -> Result<String, StorageError> {
    let json = serde_json::to_string(arg)?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

/// Map a failed response onto a [`StorageError`].
pub(crate) async fn error_for(resp: Response) -> StorageError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return StorageError::Authorization(format!("Dropbox rejected the access token: {}", text));
    }
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .ok()
        .map(|body| body.error_summary)
        .filter(|summary| !summary.is_empty())
        .unwrap_or(text);
    StorageError::Api {
        backend: BACKEND,
        status: status.as_u16(),
        message,
    }
}

/// Builder for [`DropboxClient`], mostly for pointing it at another host.
pub struct DropboxClientBuilder {
    config: ClientConfig,
    authorizer: Arc<dyn Authorizer>,
    api_url: String,
    content_url: String,
    endpoints: Option<OAuthEndpoints>,
    chunk_size: Option<u64>,
}

impl DropboxClientBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn content_url(mut self, url: impl Into<String>) -> Self {
        self.content_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn oauth_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Override the chunk size in bytes instead of whole MiB.
    pub fn chunk_size_bytes(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    pub fn build(self) -> DropboxClient {
        let endpoints = self
            .endpoints
            .unwrap_or_else(|| oauth_endpoints(&self.api_url));
        DropboxClient {
            http: Client::new(),
            session: SessionManager::new(BACKEND, endpoints, &self.config, self.authorizer),
            metadata: MetadataCache::new(self.config.metadata_cache_path(BACKEND), true),
            retry: self.config.retry_policy(),
            chunk_size: self
                .chunk_size
                .unwrap_or_else(|| self.config.chunk_size_bytes()),
            api_url: self.api_url,
            content_url: self.content_url,
        }
    }
}

/// Dropbox backend.
pub struct DropboxClient {
    pub(crate) http: Client,
    pub(crate) api_url: String,
    pub(crate) content_url: String,
    pub(crate) session: SessionManager,
    pub(crate) metadata: MetadataCache,
    pub(crate) retry: RetryPolicy,
    pub(crate) chunk_size: u64,
}

impl DropboxClient {
    pub fn new(config: &ClientConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::builder(config, authorizer).build()
    }

    pub fn builder(config: &ClientConfig, authorizer: Arc<dyn Authorizer>) -> DropboxClientBuilder {
        DropboxClientBuilder {
            config: config.clone(),
            authorizer,
            api_url: API_URL.to_string(),
            content_url: CONTENT_URL.to_string(),
            endpoints: None,
            chunk_size: None,
        }
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Call an RPC endpoint (`/2/<endpoint>` on the API host).
    pub(crate) async fn rpc<A, T>(&self, endpoint: &str, arg: &A) -> Result<T, StorageError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.session.access_token().await?;
        let url = format!("{}/2/{}", self.api_url, endpoint);
        let resp = self.http.post(&url).bearer_auth(token).json(arg).send().await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send to a content-upload endpoint without interpreting the status.
    pub(crate) async fn send_content<A>(
        &self,
        endpoint: &str,
        arg: &A,
        body: Vec<u8>,
    ) -> Result<Response, StorageError>
    where
        A: Serialize + ?Sized,
    {
        let token = self.session.access_token().await?;
        let url = format!("{}/2/{}", self.content_url, endpoint);
        Ok(self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Dropbox-API-Arg", api_arg(arg)?)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?)
    }

    pub(crate) async fn content<A, T>(
        &self,
        endpoint: &str,
        arg: &A,
        body: Vec<u8>,
    ) -> Result<T, StorageError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.send_content(endpoint, arg, body).await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Delete one path; an already-absent path is fine.
    #[instrument(skip(self), level = "debug")]
    async fn delete_path(&self, path: &str) -> Result<(), StorageError> {
        let label = format!("Delete of '{}'", path);
        let result = self
            .retry
            .run(&label, move || async move {
                self.rpc::<_, IgnoredAny>("files/delete_v2", &PathArg { path })
                    .await
                    .map(|_| ())
            })
            .await;

        match result {
            Err(e) if has_summary(&e, "path_lookup/not_found") => {
                debug!("'{}' already absent", path);
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl ObjectStore for DropboxClient {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn case_insensitive(&self) -> bool {
        true
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
            let path = match target {
                DeleteTarget::Object(object) => object.identity,
                DeleteTarget::Key(key) => dropbox_path(&key),
            };
            self.delete_path(&path).await?;
            self.metadata.delete(&path).await?;
        }
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> Result<(), StorageError> {
        self.delete_path(&dropbox_path(path)).await
    }
}
