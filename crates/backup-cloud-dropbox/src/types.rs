//! Request and response shapes of the Dropbox API v2 endpoints in use.

use serde::{Deserialize, Serialize};

/// Metadata of a stored file, as returned by listings and uploads.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// One entry of a `list_folder` feed.
#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum Metadata {
    File(FileMetadata),
    Folder,
    Deleted,
}

#[derive(Debug, Serialize)]
pub struct ListFolderArg<'a> {
    pub path: &'a str,
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
pub struct ListFolderContinueArg<'a> {
    pub cursor: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct PathArg<'a> {
    pub path: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CreateFolderArg<'a> {
    pub path: &'a str,
    pub autorename: bool,
}

/// Destination of an upload; always overwrites, without notifications.
#[derive(Debug, Serialize)]
pub struct CommitInfo<'a> {
    pub path: &'a str,
    pub mode: &'static str,
    pub mute: bool,
}

impl<'a> CommitInfo<'a> {
    pub fn overwrite(path: &'a str) -> Self {
        Self {
            path,
            mode: "overwrite",
            mute: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadSessionStartArg {
    pub close: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadSessionStartResult {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct UploadSessionCursor<'a> {
    pub session_id: &'a str,
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct UploadSessionAppendArg<'a> {
    pub cursor: UploadSessionCursor<'a>,
    pub close: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadSessionFinishArg<'a> {
    pub cursor: UploadSessionCursor<'a>,
    pub commit: CommitInfo<'a>,
}

/// Error body of a failed endpoint call (HTTP 409 and friends).
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error_summary: String,
    #[serde(default)]
    pub error: serde_json::Value,
}

impl ApiErrorBody {
    /// Offset the server expects next, for `incorrect_offset` lookup errors.
    pub fn correct_offset(&self) -> Option<u64> {
        self.error
            .get("correct_offset")
            .or_else(|| self.error.get("lookup_failed")?.get("correct_offset"))
            .and_then(serde_json::Value::as_u64)
    }
}
