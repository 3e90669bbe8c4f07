//! Authorization session establishment with an on-disk credential cache.
//!
//! The first call needing a connection loads the cached credential and
//! refreshes it, or runs the interactive OAuth code flow once. The result is
//! memoized for the life of the [`SessionManager`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::StorageError;
use crate::retry::RetryPolicy;

/// Persisted authorization artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Session credential file for one backend and API credential pair.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached credential. Unreadable or corrupt files count as absent.
    pub async fn load(&self) -> Option<Credential> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read session cache {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!(
                    "Corrupt session cache {}: {}, re-authorization required",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    pub async fn save(&self, credential: &Credential) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Io(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let json = serde_json::to_vec_pretty(credential)?;
        fs::write(&self.path, json).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to write session cache {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!("Saved session cache {}", self.path.display());
        Ok(())
    }
}

/// Interactive step of the authorization flow.
///
/// Shows `message` to the user and returns the single line they enter
/// (an authorization code). The caller bounds the wait.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn prompt(&self, message: &str) -> Result<String, StorageError>;
}

/// OAuth 2.0 authorization-code endpoints of a backend.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    /// Extra query parameters appended to the authorize URL.
    pub authorize_params: Vec<(String, String)>,
    /// Redirect URI sent with both requests, for providers requiring one.
    pub redirect_uri: Option<String>,
}

/// Live connection state shared by every call of one backend client.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Lazily establishes and memoizes the authorized session.
pub struct SessionManager {
    backend: &'static str,
    endpoints: OAuthEndpoints,
    api_key: String,
    api_secret: String,
    cache: SessionCache,
    authorizer: Arc<dyn Authorizer>,
    auth_timeout: Duration,
    retry: RetryPolicy,
    http: reqwest::Client,
    session: OnceCell<Session>,
}

impl SessionManager {
    pub fn new(
        backend: &'static str,
        endpoints: OAuthEndpoints,
        config: &ClientConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            backend,
            endpoints,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            cache: SessionCache::new(config.session_cache_path(backend)),
            authorizer,
            auth_timeout: config.auth_timeout,
            retry: config.retry_policy(),
            http: reqwest::Client::new(),
            session: OnceCell::new(),
        }
    }

    /// The live session, established on first use and reused afterwards.
    pub async fn session(&self) -> Result<&Session, StorageError> {
        self.session.get_or_try_init(|| self.establish()).await
    }

    /// Bearer token of the live session.
    pub async fn access_token(&self) -> Result<&str, StorageError> {
        Ok(self.session().await?.access_token.as_str())
    }

    #[instrument(skip(self), fields(backend = self.backend), level = "debug")]
    async fn establish(&self) -> Result<Session, StorageError> {
        if let Some(cached) = self.cache.load().await {
            match self.refresh(&cached).await {
                Ok(credential) => {
                    self.persist(&credential).await;
                    debug!("Reusing cached {} session", self.backend);
                    return Ok(Session {
                        access_token: credential.access_token,
                    });
                }
                Err(e @ StorageError::RetriesExhausted { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        "Cached {} session could not be refreshed: {}, re-authorizing",
                        self.backend, e
                    );
                }
            }
        }

        let credential = self.authorize_interactively().await?;
        self.persist(&credential).await;
        info!("Authorized new {} session", self.backend);
        Ok(Session {
            access_token: credential.access_token,
        })
    }

    async fn persist(&self, credential: &Credential) {
        if let Err(e) = self.cache.save(credential).await {
            warn!("Failed to cache {} session: {}", self.backend, e);
        }
    }

    async fn refresh(&self, cached: &Credential) -> Result<Credential, StorageError> {
        let refresh_token = match &cached.refresh_token {
            Some(token) => token.clone(),
            // Long-lived token without refresh support.
            None => return Ok(cached.clone()),
        };

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.api_key.clone()),
            ("client_secret", self.api_secret.clone()),
        ];
        let label = format!("{} token refresh", self.backend);
        let mut credential = self
            .retry
            .run(&label, || self.token_request(&form))
            .await?;

        // Providers may or may not rotate the refresh token.
        if credential.refresh_token.is_none() {
            credential.refresh_token = Some(refresh_token);
        }
        Ok(credential)
    }

    async fn authorize_interactively(&self) -> Result<Credential, StorageError> {
        let url = self.authorize_url();
        let message = format!(
            "Authorize {} access by visiting:\n\n  {}\n\nthen enter the authorization code:",
            self.backend, url
        );

        let code = tokio::time::timeout(self.auth_timeout, self.authorizer.prompt(&message))
            .await
            .map_err(|_| {
                StorageError::Authorization(format!(
                    "{} authorization timed out after {}s",
                    self.backend,
                    self.auth_timeout.as_secs()
                ))
            })??;

        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(StorageError::Authorization(format!(
                "{} authorization was not granted",
                self.backend
            )));
        }

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("client_id", self.api_key.clone()),
            ("client_secret", self.api_secret.clone()),
        ];
        if let Some(redirect_uri) = &self.endpoints.redirect_uri {
            form.push(("redirect_uri", redirect_uri.clone()));
        }

        self.token_request(&form).await.map_err(|e| {
            StorageError::Authorization(format!(
                "{} authorization code exchange failed: {}",
                self.backend, e
            ))
        })
    }

    fn authorize_url(&self) -> String {
        let mut url = format!(
            "{}?client_id={}&response_type=code",
            self.endpoints.authorize_url,
            urlencoding::encode(&self.api_key)
        );
        if let Some(redirect_uri) = &self.endpoints.redirect_uri {
            url.push_str(&format!("&redirect_uri={}", urlencoding::encode(redirect_uri)));
        }
        for (key, value) in &self.endpoints.authorize_params {
            url.push_str(&format!(
                "&{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            ));
        }
        url
    }

    async fn token_request(
        &self,
        form: &[(&str, String)],
    ) -> Result<Credential, StorageError> {
        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .form(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Api {
                backend: self.backend,
                status,
                message: body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}
