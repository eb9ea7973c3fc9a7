//! Synchronization engine
//!
//! A [`SyncBroker`] owns the registered backends and fans every
//! [`ChangeEvent`] out to all of them except the one it came from. Each
//! backend both applies foreign changes to its own storage and watches that
//! storage for changes of its own:
//!
//! - [`local::LocalBackend`] mirrors a directory tree, fed by a push-based
//!   [`local::RecursiveWatcher`]
//! - [`remote::RemoteDriveBackend`] mirrors a cloud drive through a
//!   cursor-driven poll loop
//!
//! Loops between backends are broken twice: the [`guard`] staleness check
//! skips replays that would not change anything, and the echo guard
//! suppresses the notification a backend receives for a write it just made
//! on behalf of another backend.

pub mod backoff;
pub mod broker;
pub mod guard;
pub mod local;
pub mod remote;

pub use backoff::{retry_rate_limited, BackoffPolicy};
pub use broker::SyncBroker;
pub use guard::{is_replay_needed, EchoGuard, InFlightGuard, InFlightPaths};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{BackendId, ByteStream, ChangeEvent, FileRef};

/// One storage side taking part in the mirror
///
/// Backends never talk to each other directly: they receive events from the
/// broker and pull content through the origin recorded on the event's
/// [`FileRef`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity used for fan-out exclusion and echo tracking
    fn id(&self) -> BackendId;

    /// Human readable name for logs
    fn name(&self) -> &str;

    /// Replay a change that happened on another backend
    ///
    /// Must be a no-op for events this backend produced itself.
    async fn apply(&self, event: &ChangeEvent) -> Result<()>;

    /// Open the content of a file this backend owns, `None` if it is gone
    async fn open_read_stream(&self, file: &FileRef) -> Result<Option<ByteStream>>;

    /// Last modification time of the entry at `file.path()` on this
    /// backend, `None` if no counterpart exists
    async fn modified_at(&self, file: &FileRef) -> Result<Option<DateTime<Utc>>>;
}
