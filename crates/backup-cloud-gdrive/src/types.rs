//! Google Drive API v2 resource shapes.

use serde::{Deserialize, Serialize};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Private property tagging every item this client creates with the first
/// segment of its path.
pub const ROOT_PROPERTY: &str = "backup_root";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReference {
    pub id: String,
}

/// A file or folder, as returned by `files.list` / `files.insert`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<ParentReference>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(|parent| parent.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub items: Vec<DriveItem>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Property {
    pub key: String,
    pub value: String,
    pub visibility: &'static str,
}

/// Metadata sent when creating an item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub parents: Vec<ParentReference>,
    pub properties: Vec<Property>,
}

impl NewItem {
    pub fn new(title: &str, parent_id: &str, root: &str) -> Self {
        Self {
            title: title.to_string(),
            mime_type: None,
            parents: vec![ParentReference {
                id: parent_id.to_string(),
            }],
            properties: vec![Property {
                key: ROOT_PROPERTY.to_string(),
                value: root.to_string(),
                visibility: "PRIVATE",
            }],
        }
    }

    pub fn folder(title: &str, parent_id: &str, root: &str) -> Self {
        Self {
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            ..Self::new(title, parent_id, root)
        }
    }
}

/// Quote a value for a Drive search query.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
