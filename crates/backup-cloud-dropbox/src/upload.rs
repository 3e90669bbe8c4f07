use std::io::SeekFrom;
use std::path::Path;

use backup_cloud_core::{normalize_key, CachedMetadata, RemoteObject, StorageError, UploadOptions};
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use crate::client::{dropbox_path, error_for, DropboxClient};
use crate::content_hash::file_content_hash;
use crate::types::{
    ApiErrorBody, CommitInfo, FileMetadata, UploadSessionAppendArg, UploadSessionCursor,
    UploadSessionFinishArg, UploadSessionStartArg, UploadSessionStartResult,
};

enum Append {
    Done,
    /// The server holds a different amount of data; continue from here.
    Resync(u64),
}

impl DropboxClient {
    #[instrument(skip(self, options), level = "debug", fields(update = options.is_update()))]
    pub(crate) async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteObject, StorageError> {
        let path = dropbox_path(remote_path);
        let size = tokio::fs::metadata(local_path).await?.len();

        let metadata = if size <= self.chunk_size {
            self.upload_single(local_path, &path).await?
        } else {
            self.upload_chunked(local_path, &path, size).await?
        };

        let content_hash = match metadata.content_hash.clone() {
            Some(hash) => hash,
            None => file_content_hash(local_path).await?,
        };
        self.metadata
            .put(
                &path,
                CachedMetadata {
                    content_hash: Some(content_hash.clone()),
                    rev: metadata.rev.clone(),
                    id: metadata.id.clone(),
                },
            )
            .await?;

        debug!("Uploaded {} ({} bytes) to '{}'", local_path.display(), size, path);
        Ok(RemoteObject {
            identity: metadata.path_display.unwrap_or(path),
            relative_path: normalize_key(remote_path, false),
            content_hash: Some(content_hash),
        })
    }

    async fn upload_single(&self, local_path: &Path, path: &str) -> Result<FileMetadata, StorageError> {
        let data = tokio::fs::read(local_path).await?;
        let data = &data;
        let label = format!("Upload of '{}'", path);
        self.retry
            .run(&label, move || async move {
                self.content("files/upload", &CommitInfo::overwrite(path), data.clone())
                    .await
            })
            .await
    }

    /// Upload session: one `start`, an `append_v2` per chunk, then `finish`.
    /// Each call is retried on its own.
    async fn upload_chunked(
        &self,
        local_path: &Path,
        path: &str,
        size: u64,
    ) -> Result<FileMetadata, StorageError> {
        let label = format!("Upload session start for '{}'", path);
        let session_id = self
            .retry
            .run(&label, move || async move {
                self.content::<_, UploadSessionStartResult>(
                    "files/upload_session/start",
                    &UploadSessionStartArg { close: false },
                    Vec::new(),
                )
                .await
            })
            .await?
            .session_id;
        let session_id = session_id.as_str();

        let mut file = File::open(local_path).await?;
        let mut offset = 0u64;
        let mut furthest = 0u64;
        let mut stalled = 0u32;
        while offset < size {
            let len = self.chunk_size.min(size - offset) as usize;
            let mut chunk = vec![0u8; len];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut chunk).await?;

            let chunk = &chunk;
            let label = format!("Upload of '{}' at offset {}", path, offset);
            let appended = self
                .retry
                .run(&label, move || async move {
                    self.append_chunk(session_id, offset, chunk).await
                })
                .await?;

            let next = match appended {
                Append::Done => offset + len as u64,
                Append::Resync(correct) => {
                    warn!(
                        "Upload session for '{}' expected offset {} (sent {}), resuming",
                        path, correct, offset
                    );
                    correct
                }
            };
            offset = next;
            if next > furthest {
                furthest = next;
                stalled = 0;
                continue;
            }

            // The session keeps asking for data it already acknowledged.
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
            tokio::time::sleep(self.retry.wait()).await;
        }

        let label = format!("Upload session finish for '{}'", path);
        self.retry
            .run(&label, move || async move {
                self.content(
                    "files/upload_session/finish",
                    &UploadSessionFinishArg {
                        cursor: UploadSessionCursor {
                            session_id,
                            offset: size,
                        },
                        commit: CommitInfo::overwrite(path),
                    },
                    Vec::new(),
                )
                .await
            })
            .await
    }

    async fn append_chunk(
        &self,
        session_id: &str,
        offset: u64,
        chunk: &[u8],
    ) -> Result<Append, StorageError> {
        let arg = UploadSessionAppendArg {
            cursor: UploadSessionCursor { session_id, offset },
            close: false,
        };
        let resp = self
            .send_content("files/upload_session/append_v2", &arg, chunk.to_vec())
            .await?;

        if resp.status().is_success() {
            return Ok(Append::Done);
        }
        if resp.status() != StatusCode::CONFLICT {
            return Err(error_for(resp).await);
        }

        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiErrorBody>(&text) {
            Ok(body) => match body.correct_offset() {
                Some(correct) => Ok(Append::Resync(correct)),
                None => Err(StorageError::Api {
                    backend: crate::client::BACKEND,
                    status: 409,
                    message: body.error_summary,
                }),
            },
            Err(_) => Err(StorageError::Api {
                backend: crate::client::BACKEND,
                status: 409,
                message: text,
            }),
        }
    }
}
