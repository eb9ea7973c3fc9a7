//! Error types for Tandem

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for Tandem
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "drive")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "drive"))]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path escapes sync root: {}", path.display())]
    PathEscapesRoot { path: PathBuf },

    #[error("Cannot resolve remote path: {0}")]
    Resolution(String),

    #[error("Rate limited by remote store: {reason}")]
    RateLimited { reason: String },

    #[error("Remote store error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Rate-limit responses are retried with backoff and never surfaced
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }

    /// Invariant violations that must abort the operation that raised them
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::PathEscapesRoot { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let limited = SyncError::RateLimited {
            reason: "userRateLimitExceeded".to_string(),
        };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_fatal());

        let escape = SyncError::PathEscapesRoot {
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(escape.is_fatal());
        assert!(!escape.is_rate_limited());
        assert_eq!(escape.to_string(), "Path escapes sync root: /etc/passwd");
    }
}
