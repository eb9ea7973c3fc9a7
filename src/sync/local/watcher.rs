//! Recursive directory watcher
//!
//! Watches a root and every directory below it, one non-recursive watch per
//! directory, and hands root-relative changes to the attached
//! [`FilesystemEventProcessor`]s. New directories get a watch as soon as they
//! appear; anything already inside them (a tree moved in from elsewhere) is
//! reported as created.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, SyncError};
use crate::types::{normalize_path, ChangeKind, FileKind};

/// Receiver of normalized filesystem changes
///
/// `path` is relative to the watched root and `/`-separated.
#[async_trait]
pub trait FilesystemEventProcessor: Send + Sync {
    async fn process_filesystem_event(&self, path: &str, change: ChangeKind, kind: FileKind);
}

/// Watcher configuration, not yet watching anything
pub struct RecursiveWatcher {
    root: PathBuf,
    processors: Vec<Arc<dyn FilesystemEventProcessor>>,
}

impl RecursiveWatcher {
    /// Watch `root`, which must be an existing directory
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(SyncError::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            processors: Vec::new(),
        })
    }

    /// Attach another receiver; all receivers see every change in order
    pub fn with_processor(mut self, processor: Arc<dyn FilesystemEventProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register watches on the whole existing tree
    ///
    /// Changes made after this returns are guaranteed to be observed.
    pub async fn start(self) -> Result<RunningWatcher> {
        let (events_tx, events_rx) = async_channel::unbounded();
        let watcher = RecommendedWatcher::new(
            move |result| {
                // unbounded channel, never blocks the notify thread
                if events_tx.send_blocking(result).is_err() {
                    trace!("Watcher channel closed, dropping raw event");
                }
            },
            Config::default(),
        )?;

        let mut running = RunningWatcher {
            root: self.root,
            processors: self.processors,
            watcher,
            watched: HashSet::new(),
            events_rx,
        };

        let root = running.root.clone();
        running.register_tree(&root, false).await;
        if !running.watched.contains(&root) {
            return Err(SyncError::InvalidPath(format!(
                "cannot watch {}",
                root.display()
            )));
        }
        info!(root = %root.display(), directories = running.watched.len(), "Watching local tree");
        Ok(running)
    }
}

/// A watcher with live OS registrations
pub struct RunningWatcher {
    root: PathBuf,
    processors: Vec<Arc<dyn FilesystemEventProcessor>>,
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
    events_rx: async_channel::Receiver<notify::Result<Event>>,
}

impl RunningWatcher {
    /// Number of directories currently watched
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Process notifications until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.events_rx.recv() => match received {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Watcher event channel closed");
                        break;
                    }
                },
            };

            self.process_batch(first).await;
        }
        info!(root = %self.root.display(), "Local watcher stopped");
    }

    /// Handle `first` and whatever else is already pending
    async fn process_batch(&mut self, first: notify::Result<Event>) {
        let mut batch = vec![first];
        while let Ok(more) = self.events_rx.try_recv() {
            batch.push(more);
        }

        for result in batch {
            match result {
                Ok(event) => self.handle_event(event).await,
                Err(e) => error!(error = %e, "Watcher error"),
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        trace!(?event, "Raw filesystem event");
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    self.on_change(path, ChangeKind::Created, None).await;
                }
            }
            EventKind::Remove(remove) => {
                let hint = match remove {
                    RemoveKind::Folder => Some(FileKind::Directory),
                    RemoveKind::File => Some(FileKind::File),
                    _ => None,
                };
                for path in event.paths {
                    self.on_change(path, ChangeKind::Deleted, hint).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in event.paths {
                        self.on_change(path, ChangeKind::Deleted, None).await;
                    }
                }
                RenameMode::To => {
                    for path in event.paths {
                        self.on_change(path, ChangeKind::Created, None).await;
                    }
                }
                // the From/To halves were already reported separately
                RenameMode::Both => {}
                RenameMode::Any | RenameMode::Other => {
                    for path in event.paths {
                        let change = if tokio::fs::symlink_metadata(&path).await.is_ok() {
                            ChangeKind::Created
                        } else {
                            ChangeKind::Deleted
                        };
                        self.on_change(path, change, None).await;
                    }
                }
            },
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.on_change(path, ChangeKind::Modified, None).await;
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    /// `removed_kind` is the kind the OS reported for a removal, if any
    async fn on_change(&mut self, path: PathBuf, change: ChangeKind, removed_kind: Option<FileKind>) {
        let Some(relative) = self.relative(&path) else {
            trace!(path = %path.display(), "Change outside watched root");
            return;
        };

        let kind = if change == ChangeKind::Deleted {
            // gone, so it cannot be stat'ed; otherwise a directory is one we watched
            match removed_kind {
                Some(kind) => kind,
                None if self.watched.contains(&path) => FileKind::Directory,
                None => FileKind::File,
            }
        } else {
            match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => FileKind::Directory,
                Ok(_) => FileKind::File,
                Err(_) => {
                    debug!(path = %path.display(), "Entry vanished before it could be inspected");
                    return;
                }
            }
        };

        if change == ChangeKind::Deleted && kind.is_dir() {
            self.unwatch_tree(&path);
        }

        self.emit(&relative, change, kind).await;

        if change == ChangeKind::Created && kind.is_dir() {
            self.register_tree(&path, true).await;
        }
    }

    async fn emit(&self, relative: &str, change: ChangeKind, kind: FileKind) {
        debug!(path = relative, %change, ?kind, "Local change");
        for processor in &self.processors {
            processor
                .process_filesystem_event(relative, change, kind)
                .await;
        }
    }

    /// Watch `dir` and every directory below it, breadth first
    ///
    /// With `report_contents`, entries found below `dir` are emitted as
    /// created.
    async fn register_tree(&mut self, dir: &Path, report_contents: bool) {
        let mut queue = VecDeque::from([dir.to_path_buf()]);

        while let Some(current) = queue.pop_front() {
            if self.watched.contains(&current) {
                continue;
            }
            if let Err(e) = self.watcher.watch(&current, RecursiveMode::NonRecursive) {
                warn!(path = %current.display(), error = %e, "Cannot watch directory");
                continue;
            }
            debug!(path = %current.display(), "Registered directory watch");
            self.watched.insert(current.clone());

            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %current.display(), error = %e, "Cannot list directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %current.display(), error = %e, "Directory listing failed");
                        break;
                    }
                };
                let path = entry.path();
                let is_dir = match entry.file_type().await {
                    Ok(file_type) => file_type.is_dir(),
                    Err(_) => continue,
                };

                if report_contents {
                    if let Some(relative) = self.relative(&path) {
                        let kind = if is_dir {
                            FileKind::Directory
                        } else {
                            FileKind::File
                        };
                        self.emit(&relative, ChangeKind::Created, kind).await;
                    }
                }
                if is_dir {
                    queue.push_back(path);
                }
            }
        }
    }

    /// Release the watches of a removed directory and everything below it
    fn unwatch_tree(&mut self, dir: &Path) {
        let released: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();

        for path in released {
            // the OS usually dropped the watch together with the directory
            if let Err(e) = self.watcher.unwatch(&path) {
                trace!(path = %path.display(), error = %e, "Watch already released");
            }
            self.watched.remove(&path);
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        match normalize_path(&joined) {
            Ok(normalized) if !normalized.is_empty() => Some(normalized),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(String, ChangeKind, FileKind)>>,
    }

    #[async_trait]
    impl FilesystemEventProcessor for Collect {
        async fn process_filesystem_event(&self, path: &str, change: ChangeKind, kind: FileKind) {
            self.seen.lock().push((path.to_string(), change, kind));
        }
    }

    impl Collect {
        fn has(&self, path: &str, change: ChangeKind, kind: FileKind) -> bool {
            self.seen
                .lock()
                .iter()
                .any(|(p, c, k)| p == path && *c == change && *k == kind)
        }

        async fn wait_for(&self, path: &str, change: ChangeKind, kind: FileKind) -> bool {
            for _ in 0..100 {
                if self.has(path, change, kind) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }
    }

    /// Drive a watcher in place until `collect` has seen the change
    async fn pump_until(
        running: &mut RunningWatcher,
        collect: &Collect,
        path: &str,
        change: ChangeKind,
        kind: FileKind,
    ) -> bool {
        for _ in 0..100 {
            if collect.has(path, change, kind) {
                return true;
            }
            if let Ok(Ok(first)) =
                tokio::time::timeout(Duration::from_millis(50), running.events_rx.recv()).await
            {
                running.process_batch(first).await;
            }
        }
        collect.has(path, change, kind)
    }

    #[tokio::test]
    async fn test_registers_existing_tree() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();

        let running = RecursiveWatcher::new(dir.path())
            .await
            .unwrap()
            .start()
            .await
            .unwrap();
        // root, a, a/b, a/b/c, d
        assert_eq!(running.watched_count(), 5);
    }

    #[tokio::test]
    async fn test_rejects_missing_root() {
        let dir = tempdir().unwrap();
        assert!(RecursiveWatcher::new(dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_reports_relative_changes() {
        let dir = tempdir().unwrap();
        let collect = Arc::new(Collect::default());
        let running = RecursiveWatcher::new(dir.path())
            .await
            .unwrap()
            .with_processor(collect.clone())
            .start()
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(running.run(cancel.clone()));

        std::fs::create_dir(dir.path().join("photos")).unwrap();
        assert!(
            collect
                .wait_for("photos", ChangeKind::Created, FileKind::Directory)
                .await
        );

        // the new directory is watched too
        std::fs::write(dir.path().join("photos/dog.jpg"), b"woof").unwrap();
        assert!(
            collect
                .wait_for("photos/dog.jpg", ChangeKind::Created, FileKind::File)
                .await
        );

        std::fs::remove_file(dir.path().join("photos/dog.jpg")).unwrap();
        assert!(
            collect
                .wait_for("photos/dog.jpg", ChangeKind::Deleted, FileKind::File)
                .await
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_moved_in_tree_reports_contents() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::create_dir_all(outside.path().join("album/2024")).unwrap();
        std::fs::write(outside.path().join("album/2024/cat.jpg"), b"meow").unwrap();

        let collect = Arc::new(Collect::default());
        let running = RecursiveWatcher::new(dir.path())
            .await
            .unwrap()
            .with_processor(collect.clone())
            .start()
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(running.run(cancel.clone()));

        // same filesystem, so this is a rename rather than a copy
        let target = dir.path().join("album");
        if std::fs::rename(outside.path().join("album"), &target).is_err() {
            cancel.cancel();
            return;
        }

        assert!(
            collect
                .wait_for("album/2024/cat.jpg", ChangeKind::Created, FileKind::File)
                .await
        );
        assert!(
            collect
                .wait_for("album/2024", ChangeKind::Created, FileKind::Directory)
                .await
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_directory_releases_watches() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("photos/2024")).unwrap();

        let collect = Arc::new(Collect::default());
        let mut running = RecursiveWatcher::new(dir.path())
            .await
            .unwrap()
            .with_processor(collect.clone())
            .start()
            .await
            .unwrap();
        assert_eq!(running.watched_count(), 3);

        std::fs::remove_dir_all(dir.path().join("photos")).unwrap();
        assert!(pump_until(&mut running, &collect, "photos", ChangeKind::Deleted, FileKind::Directory).await);
        assert_eq!(running.watched_count(), 1);
        assert!(!collect.has("photos", ChangeKind::Deleted, FileKind::File));

        // the released path can be watched again
        std::fs::create_dir(dir.path().join("photos")).unwrap();
        assert!(pump_until(&mut running, &collect, "photos", ChangeKind::Created, FileKind::Directory).await);
        assert_eq!(running.watched_count(), 2);

        std::fs::write(dir.path().join("photos/dog.jpg"), b"woof").unwrap();
        assert!(pump_until(&mut running, &collect, "photos/dog.jpg", ChangeKind::Created, FileKind::File).await);
    }
}
