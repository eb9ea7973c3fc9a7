//! Cloud drive backend
//!
//! Replays changes onto a [`DriveApi`] by walking and creating the folder
//! chain of each path, and turns the drive's change feed into
//! [`ChangeEvent`]s with a cursor-driven poll loop. Every drive call goes
//! through [`retry_rate_limited`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{Change, DriveApi, RemoteObject};
use super::cursor::CursorFile;
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::sync::{retry_rate_limited, Backend, BackoffPolicy, SyncBroker};
use crate::types::{join_path, leaf_name, parent_path, BackendId, ByteStream, ChangeEvent, ChangeKind, FileKind, FileRef};

/// Deepest parent chain followed before giving up on a path
const MAX_DEPTH: usize = 256;

/// Mirrors a folder of a cloud drive
pub struct RemoteDriveBackend {
    id: BackendId,
    name: String,
    api: Arc<dyn DriveApi>,
    root_folder_id: String,
    root_id: OnceCell<String>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    cursor: Mutex<Option<String>>,
    cursor_file: Option<CursorFile>,
    /// path -> folder id
    folders: DashMap<String, String>,
    /// object id -> path
    paths: DashMap<String, String>,
    /// serializes folder creation so concurrent uploads share one chain
    folder_lock: tokio::sync::Mutex<()>,
}

impl RemoteDriveBackend {
    pub fn new(api: Arc<dyn DriveApi>, config: &RemoteConfig, backoff: BackoffPolicy) -> Self {
        Self {
            id: BackendId::new(),
            name: "drive".to_string(),
            api,
            root_folder_id: config.root_folder_id.clone(),
            root_id: OnceCell::new(),
            backoff,
            poll_interval: config.poll_interval(),
            cursor: Mutex::new(config.start_cursor.clone()),
            cursor_file: config.cursor_file.clone().map(CursorFile::new),
            folders: DashMap::new(),
            paths: DashMap::new(),
            folder_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Resume the change feed from `cursor`
    pub fn with_start_cursor(self, cursor: impl Into<String>) -> Self {
        *self.cursor.lock() = Some(cursor.into());
        self
    }

    pub fn with_cursor_file(mut self, cursor_file: CursorFile) -> Self {
        self.cursor_file = Some(cursor_file);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Current change-feed cursor
    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    /// Persist the current cursor, if a cursor file is configured
    pub async fn save_cursor(&self) -> Result<()> {
        match (&self.cursor_file, self.cursor()) {
            (Some(file), Some(cursor)) => file.save(&cursor).await,
            _ => Ok(()),
        }
    }

    /// Id of the sync root, with aliases such as `root` resolved
    async fn root_id(&self) -> Result<String> {
        self.root_id
            .get_or_try_init(|| async move {
                let configured = self.root_folder_id.as_str();
                let api = &self.api;
                let root = retry_rate_limited(&self.backoff, "get root", || async move {
                    api.get(configured).await
                })
                .await?
                .ok_or_else(|| SyncError::Config(format!("root folder {configured} does not exist")))?;

                self.folders.insert(String::new(), root.id.clone());
                self.paths.insert(root.id.clone(), String::new());
                if root.id != configured {
                    self.paths.insert(configured.to_string(), String::new());
                }
                Ok::<_, SyncError>(root.id)
            })
            .await
            .cloned()
    }

    fn remember(&self, path: &str, id: &str, kind: FileKind) {
        if kind.is_dir() {
            self.folders.insert(path.to_string(), id.to_string());
        }
        self.paths.insert(id.to_string(), path.to_string());
    }

    /// Drop cached ids of `path` and everything below it
    fn forget(&self, path: &str) {
        let prefix = format!("{path}/");
        let under = |p: &str| p == path || p.starts_with(&prefix);
        self.folders.retain(|p, _| !under(p.as_str()));
        self.paths.retain(|_, p| !under(p.as_str()));
    }

    /// Id of the folder at `path`, creating missing folders along the way
    ///
    /// Existing folders are reused, so replaying a directory is idempotent.
    pub async fn ensure_folder_chain(&self, path: &str) -> Result<String> {
        let root = self.root_id().await?;
        if path.is_empty() {
            return Ok(root);
        }
        if let Some(id) = self.folders.get(path) {
            return Ok(id.value().clone());
        }

        let _lock = self.folder_lock.lock().await;
        let api = &self.api;
        let mut parent_id = root;
        let mut current = String::new();

        for segment in path.split('/') {
            current = join_path(&current, segment);
            if let Some(id) = self.folders.get(&current) {
                parent_id = id.value().clone();
                continue;
            }

            let parent = parent_id.as_str();
            let existing = retry_rate_limited(&self.backoff, "find folder", || async move {
                api.find_child(parent, segment).await
            })
            .await?;

            let folder = match existing {
                Some(object) if object.kind().is_dir() => object,
                Some(_) => {
                    return Err(SyncError::InvalidPath(format!(
                        "{current} is a file on the drive"
                    )))
                }
                None => {
                    let folder = retry_rate_limited(&self.backoff, "create folder", || async move {
                        api.create_folder(parent, segment).await
                    })
                    .await?;
                    info!(path = %current, id = %folder.id, "Created drive folder");
                    folder
                }
            };

            self.remember(&current, &folder.id, FileKind::Directory);
            parent_id = folder.id;
        }
        Ok(parent_id)
    }

    /// Untrashed object at `path`, without creating anything
    async fn lookup(&self, path: &str) -> Result<Option<RemoteObject>> {
        let root = self.root_id().await?;
        let api = &self.api;
        let mut parent_id = root;
        let mut current = String::new();
        let mut found = None;

        for segment in path.split('/') {
            current = join_path(&current, segment);
            if current != path {
                if let Some(id) = self.folders.get(&current) {
                    parent_id = id.value().clone();
                    continue;
                }
            }

            let parent = parent_id.as_str();
            let child = retry_rate_limited(&self.backoff, "find child", || async move {
                api.find_child(parent, segment).await
            })
            .await?;
            match child {
                Some(object) => {
                    parent_id = object.id.clone();
                    found = Some(object);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    /// Root-relative path of `object`, walking its parents up to the root
    ///
    /// Fails with [`SyncError::Resolution`] when a parent is missing or the
    /// object lives outside the sync root.
    pub async fn resolve_path(&self, object: &RemoteObject) -> Result<String> {
        let root = self.root_id().await?;
        let api = &self.api;
        let mut segments = vec![object.name.clone()];
        let mut parent = object.parent().map(str::to_string);

        for _ in 0..MAX_DEPTH {
            let Some(parent_id) = parent else {
                return Err(SyncError::Resolution(format!(
                    "{} is outside the sync root",
                    object.id
                )));
            };

            let prefix = if parent_id == root {
                Some(String::new())
            } else {
                self.paths.get(&parent_id).map(|p| p.value().clone())
            };
            if let Some(prefix) = prefix {
                segments.reverse();
                let relative = segments.join("/");
                return Ok(join_path(&prefix, &relative));
            }

            let id = parent_id.as_str();
            let parent_object = retry_rate_limited(&self.backoff, "get parent", || async move {
                api.get(id).await
            })
            .await?
            .ok_or_else(|| SyncError::Resolution(format!("parent {parent_id} of {} is missing", object.id)))?;

            segments.push(parent_object.name.clone());
            parent = parent_object.parent().map(str::to_string);
        }

        Err(SyncError::Resolution(format!(
            "{} is nested deeper than {MAX_DEPTH} folders",
            object.id
        )))
    }

    async fn upload(&self, file: &FileRef) -> Result<()> {
        let parent = self
            .ensure_folder_chain(parent_path(file.path()).unwrap_or(""))
            .await?;
        let name = leaf_name(file.path());
        let api = &self.api;
        let parent_ref = parent.as_str();

        let existing = retry_rate_limited(&self.backoff, "find file", || async move {
            api.find_child(parent_ref, name).await
        })
        .await?;

        let id = match existing {
            Some(object) if object.kind().is_dir() => {
                return Err(SyncError::InvalidPath(format!(
                    "{} is a folder on the drive",
                    file.path()
                )))
            }
            Some(object) => object.id,
            None => {
                if file.origin().open_read_stream(file).await?.is_none() {
                    debug!(path = file.path(), "Source vanished before upload");
                    return Ok(());
                }
                // content retries below target this id, never a new object
                let created = retry_rate_limited(&self.backoff, "create file", || async move {
                    api.create_empty_file(parent_ref, name).await
                })
                .await?;
                self.remember(file.path(), &created.id, FileKind::File);
                created.id
            }
        };

        // each attempt reopens the source, a consumed stream cannot be resent
        let id = id.as_str();
        let uploaded = retry_rate_limited(&self.backoff, "upload content", || async move {
            match file.origin().open_read_stream(file).await? {
                Some(content) => api.update_file(id, content).await.map(Some),
                None => Ok(None),
            }
        })
        .await?;

        match uploaded {
            Some(object) => {
                info!(path = file.path(), id = %object.id, "Uploaded file");
                self.remember(file.path(), &object.id, FileKind::File);
            }
            None => debug!(path = file.path(), "Source vanished before upload"),
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let Some(object) = self.lookup(path).await? else {
            debug!(path, "Already absent from the drive");
            self.forget(path);
            return Ok(());
        };

        let api = &self.api;
        let id = object.id.as_str();
        let result = retry_rate_limited(&self.backoff, "delete", || async move { api.delete(id).await }).await;
        match result {
            Ok(()) | Err(SyncError::NotFound(_)) => {
                info!(path, id, "Deleted from drive");
                self.forget(path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one page of the change feed and forward its changes
    ///
    /// Starts from the drive's current position when no cursor is known.
    /// Returns the number of changes on the page.
    pub async fn poll_once(self: &Arc<Self>, broker: &SyncBroker) -> Result<usize> {
        let api = &self.api;
        let cursor = match self.cursor() {
            Some(cursor) => cursor,
            None => {
                let saved = match &self.cursor_file {
                    Some(file) => file.load().await?,
                    None => None,
                };
                let start = match saved {
                    Some(saved) => {
                        info!(cursor = %saved, "Resuming change feed from saved cursor");
                        saved
                    }
                    None => {
                        let start = retry_rate_limited(&self.backoff, "start cursor", || async move {
                            api.start_page_token().await
                        })
                        .await?;
                        info!(cursor = %start, "Starting change feed at current position");
                        start
                    }
                };
                *self.cursor.lock() = Some(start.clone());
                start
            }
        };

        let token = cursor.as_str();
        let page = retry_rate_limited(&self.backoff, "list changes", || async move {
            api.list_changes(token).await
        })
        .await?;

        for change in &page.changes {
            self.handle_change(broker, change).await;
        }

        if let Some(next) = page.next_cursor() {
            if next != cursor {
                *self.cursor.lock() = Some(next.to_string());
                if let Err(e) = self.save_cursor().await {
                    warn!(error = %e, "Cannot persist change cursor");
                }
            }
        }
        Ok(page.changes.len())
    }

    /// Poll the change feed until `cancel` fires
    pub async fn run(self: Arc<Self>, broker: Arc<SyncBroker>, cancel: CancellationToken) -> Result<()> {
        info!(backend = %self.name, root = %self.root_folder_id, "Polling drive for changes");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.poll_once(&broker) => match polled {
                    Ok(0) => {}
                    Ok(changes) => debug!(changes, "Processed change page"),
                    Err(e) => warn!(error = %e, "Change feed poll failed"),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        self.save_cursor().await?;
        info!(backend = %self.name, "Drive poller stopped");
        Ok(())
    }

    async fn handle_change(self: &Arc<Self>, broker: &SyncBroker, change: &Change) {
        let gone = change.removed || change.file.as_ref().map(|f| f.trashed).unwrap_or(true);
        let time = change.time.unwrap_or_else(Utc::now);

        let (path, kind, change_kind, modified_at) = if gone {
            let known = self.paths.get(&change.file_id).map(|p| p.value().clone());
            let path = match (known, &change.file) {
                (Some(path), _) => path,
                (None, Some(object)) => match self.resolve_path(object).await {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(id = %change.file_id, error = %e, "Skipping removal outside the mirror");
                        return;
                    }
                },
                (None, None) => {
                    debug!(id = %change.file_id, "Removed object was never mirrored");
                    return;
                }
            };
            let kind = match &change.file {
                Some(object) => object.kind(),
                None if self.folders.contains_key(&path) => FileKind::Directory,
                None => FileKind::File,
            };
            (path, kind, ChangeKind::Deleted, time)
        } else {
            let Some(object) = &change.file else {
                return;
            };
            let path = match self.resolve_path(object).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(id = %object.id, error = %e, "Cannot place drive change");
                    return;
                }
            };

            let previous = self.paths.get(&object.id).map(|p| p.value().clone());
            let change_kind = match &previous {
                None if object.is_fresh() => ChangeKind::Created,
                Some(old) if *old != path => {
                    // renamed or moved: the old location disappears
                    self.forward(broker, &object.id, old, object.kind(), ChangeKind::Deleted, time);
                    self.forget(old);
                    ChangeKind::Created
                }
                _ => ChangeKind::Modified,
            };
            self.remember(&path, &object.id, object.kind());
            (path, object.kind(), change_kind, object.modified_time.unwrap_or(time))
        };

        if path.is_empty() {
            return;
        }
        self.forward(broker, &change.file_id, &path, kind, change_kind, modified_at);
        if change_kind == ChangeKind::Deleted {
            self.forget(&path);
        }
    }

    fn forward(
        self: &Arc<Self>,
        broker: &SyncBroker,
        id: &str,
        path: &str,
        kind: FileKind,
        change: ChangeKind,
        modified_at: DateTime<Utc>,
    ) {
        if broker.is_echo(self.id, path, change) {
            debug!(path, %change, "Echo of a replayed change, suppressing");
            return;
        }
        let origin: Arc<dyn Backend> = Arc::clone(self) as Arc<dyn Backend>;
        match FileRef::new(id, path, kind, modified_at, origin) {
            Ok(file) => {
                broker.accept(ChangeEvent::new(file, change, Utc::now()));
            }
            Err(e) => warn!(path, error = %e, "Ignoring drive change"),
        }
    }
}

#[async_trait]
impl Backend for RemoteDriveBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        let file = event.file();
        if file.is_from(self.id) {
            return Ok(());
        }

        match (event.kind(), file.kind()) {
            (ChangeKind::Deleted, _) => self.remove(file.path()).await,
            (_, FileKind::Directory) => self.ensure_folder_chain(file.path()).await.map(|_| ()),
            (_, FileKind::File) => self.upload(file).await,
        }
    }

    async fn open_read_stream(&self, file: &FileRef) -> Result<Option<ByteStream>> {
        let api = &self.api;
        let id = if file.is_from(self.id) {
            file.id().to_string()
        } else {
            match self.lookup(file.path()).await? {
                Some(object) => object.id,
                None => return Ok(None),
            }
        };
        let id = id.as_str();
        match retry_rate_limited(&self.backoff, "download", || async move { api.download(id).await }).await {
            Err(SyncError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    async fn modified_at(&self, file: &FileRef) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .lookup(file.path())
            .await?
            .and_then(|object| object.modified_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote::memory::{InMemoryDrive, ROOT_ID};

    fn stream(bytes: &'static [u8]) -> ByteStream {
        Box::new(std::io::Cursor::new(bytes))
    }

    /// Origin serving the same bytes for every file
    struct Fixed(BackendId, &'static [u8]);

    #[async_trait]
    impl Backend for Fixed {
        fn id(&self) -> BackendId {
            self.0
        }

        fn name(&self) -> &str {
            "fixed"
        }

        async fn apply(&self, _event: &ChangeEvent) -> Result<()> {
            Ok(())
        }

        async fn open_read_stream(&self, _file: &FileRef) -> Result<Option<ByteStream>> {
            Ok(Some(stream(self.1)))
        }

        async fn modified_at(&self, _file: &FileRef) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    fn backend(drive: &Arc<InMemoryDrive>) -> RemoteDriveBackend {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_retries: 8,
        };
        RemoteDriveBackend::new(drive.clone(), &RemoteConfig::default(), policy)
    }

    #[tokio::test]
    async fn test_folder_chain_is_idempotent() {
        let drive = Arc::new(InMemoryDrive::new());
        let remote = backend(&drive);

        let first = remote.ensure_folder_chain("a/b/c").await.unwrap();
        let second = remote.ensure_folder_chain("a/b/c").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(drive.count_children(ROOT_ID, "a"), 1);

        // a fresh backend with an empty cache reuses the existing folders
        let other = backend(&drive);
        assert_eq!(other.ensure_folder_chain("a/b/c").await.unwrap(), first);
        assert_eq!(drive.find_path("a/b/c").unwrap().id, first);
    }

    #[tokio::test]
    async fn test_resolve_path_round_trip() {
        let drive = Arc::new(InMemoryDrive::new());
        let remote = backend(&drive);
        let id = remote.ensure_folder_chain("photos/2024/summer").await.unwrap();

        // a fresh backend has to walk the parents itself
        let other = backend(&drive);
        let object = drive.get(&id).await.unwrap().unwrap();
        assert_eq!(other.resolve_path(&object).await.unwrap(), "photos/2024/summer");
    }

    #[tokio::test]
    async fn test_resolve_path_missing_parent() {
        let drive = Arc::new(InMemoryDrive::new());
        let remote = backend(&drive);
        let orphan = RemoteObject {
            id: "orphan".to_string(),
            name: "x.txt".to_string(),
            parents: vec!["nowhere".to_string()],
            mime_type: String::new(),
            trashed: false,
            created_time: None,
            modified_time: None,
        };
        assert!(matches!(
            remote.resolve_path(&orphan).await,
            Err(SyncError::Resolution(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_and_download() {
        let drive = Arc::new(InMemoryDrive::new());
        let folder = drive.create_folder(ROOT_ID, "docs").await.unwrap();
        drive
            .create_file(&folder.id, "a.txt", stream(b"alpha"))
            .await
            .unwrap();
        let remote = backend(&drive);

        let found = remote.lookup("docs/a.txt").await.unwrap().unwrap();
        assert_eq!(found.name, "a.txt");
        assert!(remote.lookup("docs/b.txt").await.unwrap().is_none());
        assert!(remote.lookup("missing/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_throttled_content_upload_keeps_one_object() {
        let drive = Arc::new(InMemoryDrive::new());
        let remote = backend(&drive);
        let origin: Arc<dyn Backend> = Arc::new(Fixed(BackendId::new(), b"woof"));
        let file = FileRef::new("photos/dog.jpg", "photos/dog.jpg", FileKind::File, Utc::now(), origin).unwrap();

        drive.fail_uploads(3);
        remote
            .apply(&ChangeEvent::new(file, ChangeKind::Created, Utc::now()))
            .await
            .unwrap();

        let photos = drive.find_path("photos").unwrap();
        assert_eq!(drive.count_children(&photos.id, "dog.jpg"), 1);
        let dog = drive.find_path("photos/dog.jpg").unwrap();
        assert_eq!(drive.content(&dog.id).unwrap(), b"woof");
    }

    #[tokio::test]
    async fn test_rate_limited_calls_are_retried() {
        let drive = Arc::new(InMemoryDrive::new());
        let remote = backend(&drive);

        drive.fail_next(3);
        remote.ensure_folder_chain("photos").await.unwrap();
        assert!(drive.find_path("photos").is_some());
    }
}
