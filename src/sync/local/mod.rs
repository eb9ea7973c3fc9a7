//! Local filesystem side of the mirror

pub mod backend;
pub mod watcher;

pub use backend::LocalBackend;
pub use watcher::{FilesystemEventProcessor, RecursiveWatcher, RunningWatcher};
