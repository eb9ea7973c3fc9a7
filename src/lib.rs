//! Tandem - two-way mirror between a local directory and a cloud drive
//!
//! Backends observe their own storage and publish [`ChangeEvent`]s to a
//! [`SyncBroker`](sync::SyncBroker), which replays each change on every other
//! backend. See [`sync`] for the moving parts.

pub mod config;
pub mod error;
pub mod sync;
pub mod types;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use sync::local::LocalBackend;
pub use sync::remote::RemoteDriveBackend;
pub use sync::{Backend, SyncBroker};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
