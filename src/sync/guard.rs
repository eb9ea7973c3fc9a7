//! Replay guards
//!
//! Three complementary checks keep backends from replaying changes that would
//! not change anything, or that they caused themselves:
//! - [`is_replay_needed`]: last-writer-wins timestamp comparison with a grace window
//! - [`EchoGuard`]: short-lived record of paths the broker just delivered to a backend
//! - [`InFlightPaths`]: paths a backend is mutating right now

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::{BackendId, ChangeKind, FileKind};

/// Decide whether replaying a change onto a target is worthwhile
///
/// Directories are always replayed (recreating one is idempotent). A file is
/// replayed when the target has no counterpart, or when the counterpart's
/// modification time plus `grace` is still strictly before `incoming`.
pub fn is_replay_needed(
    kind: FileKind,
    incoming: DateTime<Utc>,
    counterpart: Option<DateTime<Utc>>,
    grace: chrono::Duration,
) -> bool {
    if kind.is_dir() {
        return true;
    }
    match counterpart {
        None => true,
        Some(current) => current + grace < incoming,
    }
}

/// Paths recently delivered to each backend
///
/// The broker records `(target, path)` whenever it hands an event to a
/// target. When that target's own watcher or poller then observes the write,
/// the change is recognized as an echo and dropped instead of bouncing back.
pub struct EchoGuard {
    entries: DashMap<(BackendId, String), Instant>,
    ttl: Duration,
}

impl EchoGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that `path` was just written on `target` by the broker
    pub fn record(&self, target: BackendId, path: &str) {
        self.entries
            .insert((target, path.to_string()), Instant::now());
    }

    /// Whether a change `backend` observed at `path` is an echo
    ///
    /// Deletions also match recorded ancestors: removing a directory tree
    /// produces notifications for every entry underneath it.
    pub fn is_echo(&self, backend: BackendId, path: &str, change: ChangeKind) -> bool {
        if self.is_recent(backend, path) {
            return true;
        }
        if change == ChangeKind::Deleted {
            let mut end = 0;
            while let Some(pos) = path[end..].find('/') {
                end += pos;
                if self.is_recent(backend, &path[..end]) {
                    return true;
                }
                end += 1;
            }
        }
        false
    }

    fn is_recent(&self, backend: BackendId, path: &str) -> bool {
        let key = (backend, path.to_string());
        let expired = match self.entries.get(&key) {
            Some(recorded) => recorded.elapsed() > self.ttl,
            None => return false,
        };
        if expired {
            self.entries.remove(&key);
            return false;
        }
        true
    }

    /// Drop expired records, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, recorded| recorded.elapsed() <= ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Absolute paths currently being mutated by a backend
///
/// Shared between a backend's mutation logic and its watcher. Entries are
/// inserted before touching the filesystem and removed when the returned
/// [`InFlightGuard`] drops, independent of any TTL.
#[derive(Clone, Default)]
pub struct InFlightPaths {
    inner: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl InFlightPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as in flight until the guard is dropped
    pub fn begin(&self, path: impl Into<PathBuf>) -> InFlightGuard {
        let path = path.into();
        *self.inner.lock().entry(path.clone()).or_insert(0) += 1;
        InFlightGuard {
            paths: Arc::clone(&self.inner),
            path,
        }
    }

    /// Whether `path`, or a directory containing it, is being mutated
    pub fn contains(&self, path: &Path) -> bool {
        let inner = self.inner.lock();
        path.ancestors().any(|p| inner.contains_key(p))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Removes its path from [`InFlightPaths`] on drop
pub struct InFlightGuard {
    paths: Arc<Mutex<HashMap<PathBuf, usize>>>,
    path: PathBuf,
}

impl InFlightGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut paths = self.paths.lock();
        if let Some(count) = paths.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                paths.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_directories_always_replayed() {
        let grace = chrono::Duration::seconds(5);
        assert!(is_replay_needed(FileKind::Directory, at(0), Some(at(100)), grace));
    }

    #[test]
    fn test_missing_counterpart_replayed() {
        let grace = chrono::Duration::seconds(5);
        assert!(is_replay_needed(FileKind::File, at(0), None, grace));
    }

    #[test]
    fn test_grace_window() {
        let grace = chrono::Duration::seconds(5);
        // counterpart + 5s == incoming: not strictly before
        assert!(!is_replay_needed(FileKind::File, at(5), Some(at(0)), grace));
        assert!(is_replay_needed(FileKind::File, at(6), Some(at(0)), grace));
        // newer counterpart never overwritten
        assert!(!is_replay_needed(FileKind::File, at(0), Some(at(10)), grace));
        // within skew tolerance
        assert!(!is_replay_needed(FileKind::File, at(3), Some(at(0)), grace));
    }

    #[test]
    fn test_echo_guard_is_per_backend() {
        let guard = EchoGuard::new(Duration::from_secs(5));
        let local = BackendId::new();
        let remote = BackendId::new();

        guard.record(local, "photos/dog.jpg");
        assert!(guard.is_echo(local, "photos/dog.jpg", ChangeKind::Modified));
        assert!(!guard.is_echo(remote, "photos/dog.jpg", ChangeKind::Modified));
        assert!(!guard.is_echo(local, "photos/cat.jpg", ChangeKind::Modified));
    }

    #[test]
    fn test_echo_guard_ancestors_for_deletes_only() {
        let guard = EchoGuard::new(Duration::from_secs(5));
        let local = BackendId::new();

        guard.record(local, "photos");
        assert!(guard.is_echo(local, "photos/2024/dog.jpg", ChangeKind::Deleted));
        assert!(!guard.is_echo(local, "photos/2024/dog.jpg", ChangeKind::Created));
        assert!(!guard.is_echo(local, "photoshop/x", ChangeKind::Deleted));
    }

    #[test]
    fn test_echo_guard_expiry() {
        let guard = EchoGuard::new(Duration::from_millis(10));
        let local = BackendId::new();

        guard.record(local, "a.txt");
        assert!(guard.is_echo(local, "a.txt", ChangeKind::Created));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!guard.is_echo(local, "a.txt", ChangeKind::Created));

        guard.record(local, "b.txt");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(guard.purge_expired(), 1);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_in_flight_guard() {
        let paths = InFlightPaths::new();
        let file = PathBuf::from("/mirror/photos/dog.jpg");

        {
            let _guard = paths.begin(&file);
            assert!(paths.contains(&file));
            assert!(!paths.contains(Path::new("/mirror/photos")));
        }
        assert!(!paths.contains(&file));
        assert!(paths.is_empty());
    }

    #[test]
    fn test_in_flight_covers_descendants() {
        let paths = InFlightPaths::new();
        let _guard = paths.begin("/mirror/photos");
        assert!(paths.contains(Path::new("/mirror/photos/2024/dog.jpg")));
        assert!(!paths.contains(Path::new("/mirror/music")));
    }

    #[test]
    fn test_in_flight_nested_begins() {
        let paths = InFlightPaths::new();
        let first = paths.begin("/mirror/a");
        let second = paths.begin("/mirror/a");
        drop(first);
        assert!(paths.contains(Path::new("/mirror/a")));
        drop(second);
        assert!(paths.is_empty());
    }
}
