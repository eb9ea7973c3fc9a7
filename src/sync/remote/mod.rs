//! Cloud drive side of the mirror

pub mod api;
pub mod backend;
pub mod cursor;
#[cfg(feature = "drive")]
pub mod google;
pub mod memory;

pub use api::{Change, ChangePage, DriveApi, RemoteObject, FOLDER_MIME};
pub use backend::RemoteDriveBackend;
pub use cursor::CursorFile;
#[cfg(feature = "drive")]
pub use google::GoogleDriveClient;
pub use memory::InMemoryDrive;
