//! Cloud drive access abstraction
//!
//! [`DriveApi`] is the narrow set of drive operations the remote backend
//! needs. Objects form a tree through their `parents`; a change feed reports
//! touched object ids behind an opaque page cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ByteStream, FileKind};

/// Mime type marking folder objects
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Metadata of one drive object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub trashed: bool,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
}

impl RemoteObject {
    pub fn kind(&self) -> FileKind {
        if self.mime_type == FOLDER_MIME {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }

    pub fn parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    /// Whether the object was never modified after creation
    pub fn is_fresh(&self) -> bool {
        match (self.created_time, self.modified_time) {
            (Some(created), Some(modified)) => created == modified,
            _ => false,
        }
    }
}

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: String,
    /// The object is gone for good, not merely trashed
    #[serde(default)]
    pub removed: bool,
    /// Metadata at change time, absent for removed objects
    pub file: Option<RemoteObject>,
    pub time: Option<DateTime<Utc>>,
}

/// One page of the change feed
///
/// Exactly one of the tokens is normally set: `next_page_token` while more
/// pages follow, `new_start_page_token` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    #[serde(default)]
    pub changes: Vec<Change>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

impl ChangePage {
    /// Cursor to continue from after this page
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_page_token
            .as_deref()
            .or(self.new_start_page_token.as_deref())
    }
}

/// Operations on a cloud drive
///
/// Implementations report quota exhaustion as
/// [`SyncError::RateLimited`](crate::error::SyncError::RateLimited); callers
/// own the retry policy.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Cursor pointing at the current end of the change feed
    async fn start_page_token(&self) -> Result<String>;

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage>;

    /// Object metadata, `None` if no such object exists
    async fn get(&self, id: &str) -> Result<Option<RemoteObject>>;

    /// Untrashed child of `parent` named `name`
    async fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteObject>>;

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteObject>;

    /// Create an empty file; its content is sent with [`update_file`](Self::update_file)
    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<RemoteObject>;

    /// Replace the content of an existing file
    async fn update_file(&self, id: &str, content: ByteStream) -> Result<RemoteObject>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Content of a file, `None` if no such object exists
    async fn download(&self, id: &str) -> Result<Option<ByteStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_change_page() {
        let json = r#"{
            "changes": [
                {
                    "fileId": "f1",
                    "removed": false,
                    "time": "2024-03-01T10:00:00Z",
                    "file": {
                        "id": "f1",
                        "name": "photos",
                        "mimeType": "application/vnd.google-apps.folder",
                        "parents": ["root"],
                        "createdTime": "2024-03-01T10:00:00Z",
                        "modifiedTime": "2024-03-01T10:00:00Z"
                    }
                },
                { "fileId": "f2", "removed": true }
            ],
            "newStartPageToken": "42"
        }"#;

        let page: ChangePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.next_cursor(), Some("42"));

        let folder = page.changes[0].file.as_ref().unwrap();
        assert_eq!(folder.kind(), FileKind::Directory);
        assert_eq!(folder.parent(), Some("root"));
        assert!(folder.is_fresh());
        assert!(page.changes[1].removed);
        assert!(page.changes[1].file.is_none());
    }

    #[test]
    fn test_next_page_token_wins() {
        let page = ChangePage {
            changes: vec![],
            next_page_token: Some("7".to_string()),
            new_start_page_token: Some("9".to_string()),
        };
        assert_eq!(page.next_cursor(), Some("7"));
    }
}
