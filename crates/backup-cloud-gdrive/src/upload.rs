//! Multipart, media and resumable uploads.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use backup_cloud_core::{normalize_key, CachedMetadata, RemoteObject, StorageError, UploadOptions};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Method, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use crate::client::{error_for, parse, root_of, DriveClient};
use crate::types::{DriveItem, NewItem};

const OCTET_STREAM: &str = "application/octet-stream";

/// State of a resumable session after a request.
enum Progress {
    /// Bytes `0..offset` are stored.
    Offset(u64),
    Done(DriveItem),
}

/// Next offset from a `308 Resume Incomplete` response's `Range` header
/// (`bytes=0-<last>`). No header means nothing is stored yet.
fn confirmed_offset(resp: &Response) -> u64 {
    resp.headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|range| range.rsplit('-').next())
        .and_then(|last| last.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .unwrap_or(0)
}

async fn progress(resp: Response) -> Result<Progress, StorageError> {
    if resp.status() == StatusCode::PERMANENT_REDIRECT {
        return Ok(Progress::Offset(confirmed_offset(&resp)));
    }
    parse(resp).await.map(Progress::Done)
}

fn multipart_body(boundary: &str, metadata: &[u8], content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(
        format!("--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n", boundary).as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(
        format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", boundary, OCTET_STREAM).as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

fn boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("backup_cloud_{:x}", nanos)
}

impl DriveClient {
    #[instrument(skip(self, options), level = "debug", fields(update = options.is_update()))]
    pub(crate) async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteObject, StorageError> {
        let path = normalize_key(remote_path, false);
        let size = tokio::fs::metadata(local_path).await?.len();

        let existing = if options.is_update() {
            self.known_id(&path).await
        } else {
            None
        };

        let item = match existing {
            Some(id) => match self.update_item(local_path, &id, size).await {
                Ok(item) => item,
                Err(StorageError::NotFound(_)) => {
                    debug!("Drive item {} for '{}' is gone, creating anew", id, path);
                    self.forget(&path);
                    self.create_item(local_path, &path, size).await?
                }
                Err(e) => return Err(e),
            },
            None => self.create_item(local_path, &path, size).await?,
        };

        self.remember(&path, &item.id);
        self.metadata
            .put(
                &path,
                CachedMetadata {
                    content_hash: item.md5_checksum.clone(),
                    rev: None,
                    id: Some(item.id.clone()),
                },
            )
            .await?;

        debug!("Uploaded {} ({} bytes) to '{}'", local_path.display(), size, path);
        Ok(RemoteObject {
            identity: item.id,
            relative_path: path,
            content_hash: item.md5_checksum,
        })
    }

    async fn create_item(
        &self,
        local_path: &Path,
        path: &str,
        size: u64,
    ) -> Result<DriveItem, StorageError> {
        let (folder, title) = path.rsplit_once('/').unwrap_or(("", path));
        let parent_id = self
            .resolve_folder(folder, true)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Drive folder '{}'", folder)))?;
        let metadata = NewItem::new(title, &parent_id, root_of(path));

        if size > self.chunk_size {
            let url = format!("{}/files?uploadType=resumable", self.upload_url);
            let session = self
                .start_session(Method::POST, &url, &serde_json::to_value(&metadata)?, size)
                .await?;
            return self.send_resumable(&session, local_path, size, path).await;
        }

        let content = tokio::fs::read(local_path).await?;
        let metadata = serde_json::to_vec(&metadata)?;
        let boundary = boundary();
        let body = multipart_body(&boundary, &metadata, &content);
        let (body, boundary) = (&body, boundary.as_str());
        let url = format!("{}/files?uploadType=multipart", self.upload_url);
        let url = url.as_str();
        let label = format!("Upload of '{}'", path);

        self.retry
            .run(&label, move || async move {
                let resp = self
                    .authorized(Method::POST, url)
                    .await?
                    .header(
                        CONTENT_TYPE,
                        format!("multipart/related; boundary={}", boundary),
                    )
                    .body(body.clone())
                    .send()
                    .await?;
                parse(resp).await
            })
            .await
    }

    async fn update_item(
        &self,
        local_path: &Path,
        id: &str,
        size: u64,
    ) -> Result<DriveItem, StorageError> {
        if size > self.chunk_size {
            let url = format!("{}/files/{}?uploadType=resumable", self.upload_url, id);
            let session = self
                .start_session(Method::PUT, &url, &serde_json::json!({}), size)
                .await?;
            return self.send_resumable(&session, local_path, size, id).await;
        }

        let content = tokio::fs::read(local_path).await?;
        let content = &content;
        let url = format!("{}/files/{}?uploadType=media", self.upload_url, id);
        let url = url.as_str();
        let label = format!("Update of Drive item {}", id);

        self.retry
            .run(&label, move || async move {
                let resp = self
                    .authorized(Method::PUT, url)
                    .await?
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .body(content.clone())
                    .send()
                    .await?;
                parse(resp).await
            })
            .await
    }

    /// Open a resumable session; returns the session URI.
    async fn start_session(
        &self,
        method: Method,
        url: &str,
        metadata: &serde_json::Value,
        size: u64,
    ) -> Result<String, StorageError> {
        let method = &method;
        let label = format!("Upload session start at {}", url);
        self.retry
            .run(&label, move || async move {
                let resp = self
                    .authorized(method.clone(), url)
                    .await?
                    .header("X-Upload-Content-Type", OCTET_STREAM)
                    .header("X-Upload-Content-Length", size)
                    .json(metadata)
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(error_for(resp).await);
                }
                resp.headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| StorageError::Api {
                        backend: crate::client::BACKEND,
                        status: 502,
                        message: "Resumable session response without Location".into(),
                    })
            })
            .await
    }

    /// Send the file in chunks. A failed chunk re-queries the session and
    /// resumes from the offset the server confirms.
    ///
    /// Turns that do not move the confirmed offset past its furthest point
    /// count against the retry policy like failed attempts.
    async fn send_resumable(
        &self,
        session: &str,
        local_path: &Path,
        size: u64,
        what: &str,
    ) -> Result<DriveItem, StorageError> {
        let mut offset = 0u64;
        let mut furthest = 0u64;
        let mut stalled = 0u32;
        loop {
            let resume = AtomicBool::new(false);
            let resume = &resume;
            let label = format!("Upload of '{}' at offset {}", what, offset);

            let step = self
                .retry
                .run(&label, move || async move {
                    let start = if resume.swap(true, Ordering::SeqCst) {
                        match self.session_status(session, size).await? {
                            Progress::Offset(confirmed) => confirmed,
                            done => return Ok(done),
                        }
                    } else {
                        offset
                    };
                    self.put_chunk(session, local_path, start, size).await
                })
                .await?;

            let confirmed = match step {
                Progress::Done(item) => return Ok(item),
                Progress::Offset(confirmed) => confirmed,
            };
            offset = confirmed;
            if confirmed > furthest {
                furthest = confirmed;
                stalled = 0;
                continue;
            }

            stalled += 1;
            if stalled >= self.retry.max_attempts() {
                return Err(StorageError::RetriesExhausted {
                    operation: label,
                    attempts: stalled,
                    last_error: format!(
                        "Upload session made no progress past {} of {} bytes",
                        furthest, size
                    ),
                });
            }
            warn!(
                stalled,
                "Upload session for '{}' did not advance past {} bytes, retrying", what, furthest
            );
            tokio::time::sleep(self.retry.wait()).await;
        }
    }

    async fn put_chunk(
        &self,
        session: &str,
        local_path: &Path,
        start: u64,
        size: u64,
    ) -> Result<Progress, StorageError> {
        if start >= size {
            return self.session_status(session, size).await;
        }
        let len = self.chunk_size.min(size - start);
        let mut chunk = vec![0u8; len as usize];
        let mut file = File::open(local_path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk).await?;

        let range = format!("bytes {}-{}/{}", start, start + len - 1, size);
        let resp = self
            .authorized(Method::PUT, session)
            .await?
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await?;
        progress(resp).await
    }

    async fn session_status(&self, session: &str, size: u64) -> Result<Progress, StorageError> {
        let resp = self
            .authorized(Method::PUT, session)
            .await?
            .header(CONTENT_RANGE, format!("bytes */{}", size))
            .body(Vec::new())
            .send()
            .await?;
        progress(resp).await
    }
}
