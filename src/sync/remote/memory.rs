//! In-process drive
//!
//! A complete [`DriveApi`] kept in memory: an object tree, a numbered change
//! log behind page tokens and injectable rate-limit failures. Used by the
//! test suite and for dry runs without network access.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use super::api::{Change, ChangePage, DriveApi, RemoteObject, FOLDER_MIME};
use crate::error::{Result, SyncError};
use crate::types::{ByteStream, FileKind};

/// Id of the drive root folder
pub const ROOT_ID: &str = "root";

const DEFAULT_PAGE_SIZE: usize = 100;

struct Stored {
    meta: RemoteObject,
    content: Vec<u8>,
}

struct State {
    objects: BTreeMap<String, Stored>,
    log: Vec<Change>,
    next_id: u64,
    last_tick: DateTime<Utc>,
}

impl State {
    /// Strictly increasing timestamps, so modifications never tie creations
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = if now > self.last_tick {
            now
        } else {
            self.last_tick + chrono::Duration::milliseconds(1)
        };
        self.last_tick = next;
        next
    }

    fn log(&mut self, file_id: &str, time: DateTime<Utc>) {
        let file = self.objects.get(file_id).map(|s| s.meta.clone());
        self.log.push(Change {
            file_id: file_id.to_string(),
            removed: file.is_none(),
            file,
            time: Some(time),
        });
    }

    fn folder(&self, id: &str) -> Result<&RemoteObject> {
        match self.objects.get(id) {
            Some(stored) if stored.meta.kind().is_dir() && !stored.meta.trashed => Ok(&stored.meta),
            Some(_) => Err(SyncError::Remote {
                status: 400,
                message: format!("{id} is not a usable folder"),
            }),
            None => Err(SyncError::NotFound(id.to_string())),
        }
    }

    fn insert(&mut self, parent: &str, name: &str, mime_type: &str, content: Vec<u8>) -> Result<RemoteObject> {
        self.folder(parent)?;
        let now = self.tick();
        self.next_id += 1;
        let meta = RemoteObject {
            id: format!("obj-{}", self.next_id),
            name: name.to_string(),
            parents: vec![parent.to_string()],
            mime_type: mime_type.to_string(),
            trashed: false,
            created_time: Some(now),
            modified_time: Some(now),
        };
        self.objects.insert(
            meta.id.clone(),
            Stored {
                meta: meta.clone(),
                content,
            },
        );
        self.log(&meta.id, now);
        Ok(meta)
    }

    fn descendants(&self, id: &str) -> Vec<String> {
        let mut found = vec![id.to_string()];
        let mut i = 0;
        while i < found.len() {
            let current = found[i].clone();
            found.extend(
                self.objects
                    .values()
                    .filter(|s| s.meta.parents.iter().any(|p| *p == current))
                    .map(|s| s.meta.id.clone()),
            );
            i += 1;
        }
        found
    }
}

/// Drive held entirely in memory
pub struct InMemoryDrive {
    state: Mutex<State>,
    page_size: usize,
    rate_limited: AtomicU32,
    uploads_limited: AtomicU32,
    calls: AtomicU64,
}

impl Default for InMemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDrive {
    /// Empty drive containing only the root folder
    pub fn new() -> Self {
        let now = Utc::now();
        let root = RemoteObject {
            id: ROOT_ID.to_string(),
            name: "My Drive".to_string(),
            parents: Vec::new(),
            mime_type: FOLDER_MIME.to_string(),
            trashed: false,
            created_time: Some(now),
            modified_time: Some(now),
        };
        let mut objects = BTreeMap::new();
        objects.insert(
            ROOT_ID.to_string(),
            Stored {
                meta: root,
                content: Vec::new(),
            },
        );
        Self {
            state: Mutex::new(State {
                objects,
                log: Vec::new(),
                next_id: 0,
                last_tick: now,
            }),
            page_size: DEFAULT_PAGE_SIZE,
            rate_limited: AtomicU32::new(0),
            uploads_limited: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Limit how many changes one page carries
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make the next `n` calls fail with a rate-limit error
    pub fn fail_next(&self, n: u32) {
        self.rate_limited.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` content uploads fail with a rate-limit error
    ///
    /// Metadata calls keep succeeding, so a file can be created and then
    /// have its content step throttled.
    pub fn fail_uploads(&self, n: u32) {
        self.uploads_limited.store(n, Ordering::SeqCst);
    }

    /// Total calls made, failed ones included
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Untrashed object at a root-relative path
    pub fn find_path(&self, path: &str) -> Option<RemoteObject> {
        let state = self.state.lock();
        let mut current = ROOT_ID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = state
                .objects
                .values()
                .find(|s| !s.meta.trashed && s.meta.name == segment && s.meta.parent() == Some(current.as_str()))?
                .meta
                .id
                .clone();
        }
        state.objects.get(&current).map(|s| s.meta.clone())
    }

    /// Number of untrashed objects named `name` directly under `parent`
    pub fn count_children(&self, parent: &str, name: &str) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|s| !s.meta.trashed && s.meta.name == name && s.meta.parent() == Some(parent))
            .count()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(id).map(|s| s.content.clone())
    }

    /// Upload a file with its content in one step, as the web UI does
    pub async fn create_file(&self, parent: &str, name: &str, content: ByteStream) -> Result<RemoteObject> {
        self.check_quota()?;
        let content = read_all(content).await?;
        self.state
            .lock()
            .insert(parent, name, "application/octet-stream", content)
    }

    /// Move an object to the trash, as a user would
    pub fn trash(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let now = state.tick();
        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        stored.meta.trashed = true;
        stored.meta.modified_time = Some(now);
        state.log(id, now);
        Ok(())
    }

    fn check_quota(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        take_failure(&self.rate_limited)
    }
}

fn take_failure(pending: &AtomicU32) -> Result<()> {
    let limited = pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if limited {
        return Err(SyncError::RateLimited {
            reason: "User Rate Limit Exceeded".to_string(),
        });
    }
    Ok(())
}

async fn read_all(mut content: ByteStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    content.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl DriveApi for InMemoryDrive {
    async fn start_page_token(&self) -> Result<String> {
        self.check_quota()?;
        Ok(self.state.lock().log.len().to_string())
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        self.check_quota()?;
        let start: usize = page_token.parse().map_err(|_| SyncError::Remote {
            status: 400,
            message: format!("invalid page token {page_token:?}"),
        })?;

        let state = self.state.lock();
        let len = state.log.len();
        let start = start.min(len);
        let end = (start + self.page_size).min(len);
        let changes = state.log[start..end].to_vec();

        Ok(if end < len {
            ChangePage {
                changes,
                next_page_token: Some(end.to_string()),
                new_start_page_token: None,
            }
        } else {
            ChangePage {
                changes,
                next_page_token: None,
                new_start_page_token: Some(len.to_string()),
            }
        })
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteObject>> {
        self.check_quota()?;
        Ok(self.state.lock().objects.get(id).map(|s| s.meta.clone()))
    }

    async fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteObject>> {
        self.check_quota()?;
        Ok(self
            .state
            .lock()
            .objects
            .values()
            .find(|s| !s.meta.trashed && s.meta.name == name && s.meta.parent() == Some(parent))
            .map(|s| s.meta.clone()))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteObject> {
        self.check_quota()?;
        self.state.lock().insert(parent, name, FOLDER_MIME, Vec::new())
    }

    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<RemoteObject> {
        self.check_quota()?;
        self.state
            .lock()
            .insert(parent, name, "application/octet-stream", Vec::new())
    }

    async fn update_file(&self, id: &str, content: ByteStream) -> Result<RemoteObject> {
        self.check_quota()?;
        take_failure(&self.uploads_limited)?;
        let content = read_all(content).await?;

        let mut state = self.state.lock();
        let now = state.tick();
        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if stored.meta.kind() == FileKind::Directory {
            return Err(SyncError::Remote {
                status: 400,
                message: format!("{id} is a folder"),
            });
        }
        stored.content = content;
        stored.meta.modified_time = Some(now);
        let meta = stored.meta.clone();
        state.log(id, now);
        Ok(meta)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_quota()?;
        if id == ROOT_ID {
            return Err(SyncError::Remote {
                status: 403,
                message: "the root folder cannot be deleted".to_string(),
            });
        }

        let mut state = self.state.lock();
        if !state.objects.contains_key(id) {
            return Err(SyncError::NotFound(id.to_string()));
        }
        let now = state.tick();
        for removed in state.descendants(id) {
            state.objects.remove(&removed);
            state.log(&removed, now);
        }
        Ok(())
    }

    async fn download(&self, id: &str) -> Result<Option<ByteStream>> {
        self.check_quota()?;
        let content = self.state.lock().objects.get(id).map(|s| s.content.clone());
        Ok(content.map(|bytes| Box::new(std::io::Cursor::new(bytes)) as ByteStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(bytes: &'static [u8]) -> ByteStream {
        Box::new(std::io::Cursor::new(bytes))
    }

    #[tokio::test]
    async fn test_tree_and_change_log() {
        let drive = InMemoryDrive::new().with_page_size(2);
        let start = drive.start_page_token().await.unwrap();

        let photos = drive.create_folder(ROOT_ID, "photos").await.unwrap();
        let dog = drive
            .create_file(&photos.id, "dog.jpg", stream(b"woof"))
            .await
            .unwrap();
        assert!(dog.is_fresh());
        drive.update_file(&dog.id, stream(b"WOOF")).await.unwrap();

        assert_eq!(drive.find_path("photos/dog.jpg").unwrap().id, dog.id);
        assert_eq!(drive.content(&dog.id).unwrap(), b"WOOF");

        let first = drive.list_changes(&start).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        let second = drive
            .list_changes(first.next_page_token.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(second.changes.len(), 1);
        assert!(second.next_page_token.is_none());
        let updated = second.changes[0].file.as_ref().unwrap();
        assert!(!updated.is_fresh());

        let tail = drive
            .list_changes(second.new_start_page_token.as_deref().unwrap())
            .await
            .unwrap();
        assert!(tail.changes.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let drive = InMemoryDrive::new();
        let photos = drive.create_folder(ROOT_ID, "photos").await.unwrap();
        drive
            .create_file(&photos.id, "dog.jpg", stream(b"woof"))
            .await
            .unwrap();
        let token = drive.start_page_token().await.unwrap();

        drive.delete(&photos.id).await.unwrap();
        assert!(drive.find_path("photos").is_none());
        assert!(drive.find_path("photos/dog.jpg").is_none());

        let page = drive.list_changes(&token).await.unwrap();
        assert_eq!(page.changes.len(), 2);
        assert!(page.changes.iter().all(|c| c.removed));
        assert!(matches!(
            drive.delete(&photos.id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_rate_limits() {
        let drive = InMemoryDrive::new();
        drive.fail_next(2);
        assert!(drive.get(ROOT_ID).await.unwrap_err().is_rate_limited());
        assert!(drive.get(ROOT_ID).await.unwrap_err().is_rate_limited());
        assert!(drive.get(ROOT_ID).await.unwrap().is_some());
        assert_eq!(drive.calls(), 3);
    }

    #[tokio::test]
    async fn test_injected_upload_limits_spare_metadata() {
        let drive = InMemoryDrive::new();
        drive.fail_uploads(1);

        let doc = drive.create_empty_file(ROOT_ID, "notes.txt").await.unwrap();
        assert!(drive
            .update_file(&doc.id, stream(b"x"))
            .await
            .unwrap_err()
            .is_rate_limited());
        assert_eq!(drive.content(&doc.id).unwrap(), b"");

        drive.update_file(&doc.id, stream(b"x")).await.unwrap();
        assert_eq!(drive.content(&doc.id).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_trash_hides_from_lookup() {
        let drive = InMemoryDrive::new();
        let doc = drive
            .create_file(ROOT_ID, "notes.txt", stream(b"x"))
            .await
            .unwrap();
        drive.trash(&doc.id).unwrap();
        assert!(drive.find_child(ROOT_ID, "notes.txt").await.unwrap().is_none());
        assert!(drive.get(&doc.id).await.unwrap().unwrap().trashed);
    }
}
