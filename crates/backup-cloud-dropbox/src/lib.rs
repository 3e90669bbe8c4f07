//! Dropbox backend for backup-cloud.
//!
//! Listing walks the recursive `list_folder` delta feed; uploads above the
//! chunk threshold go through resumable upload sessions.

mod client;
mod content_hash;
mod list;
mod types;
mod upload;

pub use client::{oauth_endpoints, DropboxClient, DropboxClientBuilder, BACKEND};
pub use content_hash::{file_content_hash, ContentHasher};
