//! Persistent change-feed cursor

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// A change-feed cursor stored in a small text file
///
/// Writes go through a sibling temp file and a rename, so a crash never
/// leaves a truncated cursor behind.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored cursor, `None` if nothing was saved yet
    pub async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => {
                let cursor = text.trim();
                Ok((!cursor.is_empty()).then(|| cursor.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, cursor: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, cursor.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), cursor, "Saved change cursor");
        Ok(())
    }
}
