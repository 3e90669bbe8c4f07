//! Google Drive backend for backup-cloud.
//!
//! Drive exposes a flat item list with parent references. Prefixes are
//! resolved to folder ids under a per-client lock, and listings rebuild
//! relative paths in memory from one paginated query.

mod client;
mod folders;
mod list;
mod tree;
mod types;
mod upload;

pub use client::{oauth_endpoints, DriveClient, DriveClientBuilder, BACKEND};
pub use folders::{FOLDER_LOOKUP_ATTEMPTS, ROOT_ID};
pub use tree::{reconstruct_paths, ItemPath};
pub use types::{DriveItem, ParentReference, FOLDER_MIME_TYPE, ROOT_PROPERTY};
