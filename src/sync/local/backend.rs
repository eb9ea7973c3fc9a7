//! Local directory backend

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::watcher::{FilesystemEventProcessor, RecursiveWatcher};
use crate::error::{Result, SyncError};
use crate::sync::{Backend, InFlightPaths, SyncBroker};
use crate::types::{normalize_path, BackendId, ByteStream, ChangeEvent, ChangeKind, FileKind, FileRef};

/// Mirrors a directory tree on the local disk
///
/// Every mutation stays inside the canonical root; a target that would land
/// outside it fails with [`SyncError::PathEscapesRoot`].
pub struct LocalBackend {
    id: BackendId,
    name: String,
    root: PathBuf,
    in_flight: InFlightPaths,
}

impl LocalBackend {
    /// Open `root` as a sync root, creating it when missing
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;
        Ok(Self {
            id: BackendId::new(),
            name: "local".to_string(),
            root,
            in_flight: InFlightPaths::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_flight(&self) -> &InFlightPaths {
        &self.in_flight
    }

    /// Build a watcher over the root that forwards changes to `broker`
    ///
    /// More processors can be attached before the watcher is started.
    pub async fn watcher(self: &Arc<Self>, broker: Arc<SyncBroker>) -> Result<RecursiveWatcher> {
        let forwarder = Arc::new(Forwarder {
            backend: Arc::clone(self),
            broker,
        });
        Ok(RecursiveWatcher::new(&self.root).await?.with_processor(forwarder))
    }

    /// Watch the root and forward changes until `cancel` fires
    pub async fn run(self: Arc<Self>, broker: Arc<SyncBroker>, cancel: CancellationToken) -> Result<()> {
        let running = self.watcher(broker).await?.start().await?;
        running.run(cancel).await;
        Ok(())
    }

    /// Turn a root-relative path observed by the watcher into a change
    async fn forward(self: &Arc<Self>, broker: &SyncBroker, path: &str, change: ChangeKind, kind: FileKind) {
        let absolute = match self.resolve(path).await {
            Ok(absolute) => absolute,
            Err(e) => {
                warn!(path, error = %e, "Ignoring local change");
                return;
            }
        };

        if self.in_flight.contains(&absolute) {
            debug!(path, %change, "Change caused by an in-flight write, suppressing");
            return;
        }
        if broker.is_echo(self.id, path, change) {
            debug!(path, %change, "Echo of a replayed change, suppressing");
            return;
        }

        let modified_at = match change {
            ChangeKind::Deleted => Utc::now(),
            _ => match tokio::fs::symlink_metadata(&absolute).await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => Utc::now(),
            },
        };

        let origin: Arc<dyn Backend> = Arc::clone(self) as Arc<dyn Backend>;
        match FileRef::new(path, path, kind, modified_at, origin) {
            Ok(file) => {
                broker.accept(ChangeEvent::new(file, change, Utc::now()));
            }
            Err(e) => warn!(path, error = %e, "Ignoring local change"),
        }
    }

    /// Absolute location of a root-relative path
    ///
    /// Fails when the result is the root itself or lies outside it, whether
    /// through a symlinked parent or a symlink at the path itself.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf> {
        self.locate(path, true).await
    }

    /// Like [`resolve`](Self::resolve); without `follow_leaf` a symlink at the
    /// path itself is not followed, which is all a removal needs.
    async fn locate(&self, path: &str, follow_leaf: bool) -> Result<PathBuf> {
        let escapes = || SyncError::PathEscapesRoot {
            path: PathBuf::from(path),
        };
        let normalized = normalize_path(path).map_err(|_| escapes())?;
        if normalized.is_empty() {
            return Err(escapes());
        }

        let mut absolute = self.root.clone();
        absolute.extend(normalized.split('/'));
        if !absolute.starts_with(&self.root) {
            return Err(escapes());
        }

        // the deepest existing entry decides where the path really leads
        let mut candidate = if follow_leaf {
            Some(absolute.as_path())
        } else {
            absolute.parent()
        };
        while let Some(current) = candidate.filter(|p| p.starts_with(&self.root)) {
            match tokio::fs::symlink_metadata(current).await {
                Ok(_) => {
                    // a dangling link cannot be canonicalized and leads nowhere safe
                    let real = tokio::fs::canonicalize(current)
                        .await
                        .map_err(|_| escapes())?;
                    if !real.starts_with(&self.root) {
                        return Err(escapes());
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => candidate = current.parent(),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(absolute)
    }

    /// Topmost missing directory between the root and `dir`
    async fn first_missing(&self, dir: &Path) -> Option<PathBuf> {
        let mut missing = None;
        for ancestor in dir.ancestors() {
            if ancestor == self.root || !ancestor.starts_with(&self.root) {
                break;
            }
            if tokio::fs::try_exists(ancestor).await.unwrap_or(false) {
                break;
            }
            missing = Some(ancestor.to_path_buf());
        }
        missing
    }

    async fn write_directory(&self, target: &Path) -> Result<()> {
        let guarded = self
            .first_missing(target)
            .await
            .unwrap_or_else(|| target.to_path_buf());
        let _guard = self.in_flight.begin(guarded);
        tokio::fs::create_dir_all(target).await?;
        Ok(())
    }

    async fn write_file(&self, file: &FileRef, target: &Path) -> Result<()> {
        let Some(mut source) = file.origin().open_read_stream(file).await? else {
            debug!(path = file.path(), "Source vanished before it could be copied");
            return Ok(());
        };

        let _file_guard = self.in_flight.begin(target);
        let _parent_guard = match target.parent() {
            Some(parent) => self
                .first_missing(parent)
                .await
                .map(|missing| self.in_flight.begin(missing)),
            None => None,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::metadata(target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(SyncError::InvalidPath(format!(
                "{} is a directory locally",
                file.path()
            )));
        }

        let mut out = tokio::fs::File::create(target).await?;
        let bytes = tokio::io::copy(&mut source, &mut out).await?;
        out.flush().await?;
        info!(path = file.path(), bytes, "Wrote local file");
        Ok(())
    }

    async fn remove(&self, target: &Path) -> Result<()> {
        let _guard = self.in_flight.begin(target);
        let result = match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(target).await,
            Ok(_) => tokio::fs::remove_file(target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(path = %target.display(), "Removed local entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %target.display(), "Already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
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
            (ChangeKind::Deleted, _) => {
                let target = self.locate(file.path(), false).await?;
                self.remove(&target).await
            }
            (_, FileKind::Directory) => {
                let target = self.resolve(file.path()).await?;
                self.write_directory(&target).await
            }
            (_, FileKind::File) => {
                let target = self.resolve(file.path()).await?;
                self.write_file(file, &target).await
            }
        }
    }

    async fn open_read_stream(&self, file: &FileRef) -> Result<Option<ByteStream>> {
        let path = self.resolve(file.path()).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(Some(Box::new(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn modified_at(&self, file: &FileRef) -> Result<Option<DateTime<Utc>>> {
        let path = self.resolve(file.path()).await?;
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct Forwarder {
    backend: Arc<LocalBackend>,
    broker: Arc<SyncBroker>,
}

#[async_trait]
impl FilesystemEventProcessor for Forwarder {
    async fn process_filesystem_event(&self, path: &str, change: ChangeKind, kind: FileKind) {
        self.backend
            .forward(&self.broker, path, change, kind)
            .await;
    }
}
