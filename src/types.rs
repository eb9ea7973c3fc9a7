//! Core types for Tandem

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::sync::Backend;

/// Readable content handed from one backend to another
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Path separator used by every root-relative path, whatever the backend
pub const SEPARATOR: char = '/';

/// Identity of a registered backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(Uuid);

impl BackendId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an entry is a regular file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn is_dir(self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

/// What happened to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One file or directory as known to one backend
///
/// `path` is root-relative and `/`-separated on every backend. `id` is the
/// backend-local handle: the normalized path for the local tree, the object
/// id for the remote drive.
#[derive(Clone)]
pub struct FileRef {
    id: String,
    path: String,
    name: String,
    kind: FileKind,
    modified_at: DateTime<Utc>,
    origin: Arc<dyn Backend>,
}

impl FileRef {
    /// Build a file reference; `path` is normalized and `name` derived from it
    pub fn new(
        id: impl Into<String>,
        path: &str,
        kind: FileKind,
        modified_at: DateTime<Utc>,
        origin: Arc<dyn Backend>,
    ) -> Result<Self> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(SyncError::InvalidPath(
                "the sync root itself cannot be a change target".to_string(),
            ));
        }
        let name = leaf_name(&path).to_string();
        Ok(Self {
            id: id.into(),
            path,
            name,
            kind,
            modified_at,
            origin,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Backend that produced this value
    pub fn origin(&self) -> &Arc<dyn Backend> {
        &self.origin
    }

    /// Whether `backend` produced this value
    pub fn is_from(&self, backend: BackendId) -> bool {
        self.origin.id() == backend
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("modified_at", &self.modified_at)
            .field("origin", &self.origin.name())
            .finish()
    }
}

/// A change observed on one backend, to be replayed on the others
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    file: FileRef,
    kind: ChangeKind,
    timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(file: FileRef, kind: ChangeKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            file,
            kind,
            timestamp,
        }
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Normalize a root-relative path to the canonical `/`-separated form
///
/// Backslashes become `/`, empty and `.` segments are dropped and leading or
/// trailing separators are stripped. `..` segments and NUL bytes are
/// rejected. The empty string denotes the root. Idempotent.
pub fn normalize_path(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(SyncError::InvalidPath(format!("{raw:?} contains NUL")));
    }

    let mut segments = Vec::new();
    for segment in raw.split(&['/', '\\'][..]) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(SyncError::InvalidPath(format!(
                    "{raw:?} contains a parent segment"
                )))
            }
            s => segments.push(s),
        }
    }

    Ok(segments.join("/"))
}

/// Last segment of a normalized path
pub fn leaf_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Parent of a normalized path, `None` for top-level entries
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once(SEPARATOR).map(|(parent, _)| parent)
}

/// Join a normalized parent path and a leaf name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{SEPARATOR}{name}")
    }
}
