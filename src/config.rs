//! Configuration for the sync engine
//!
//! Loaded from TOML; every field has a default so a partial file is enough.
//!
//! ```toml
//! [local]
//! root = "~/Tandem"
//!
//! [remote]
//! root_folder_id = "root"
//! cursor_file = "~/.local/share/tandem/cursor"
//!
//! [engine]
//! grace_window_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Default Drive v3 metadata endpoint
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Default Drive v3 media upload endpoint
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub engine: EngineConfig,
    pub backoff: BackoffConfig,
}

/// Local tree settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory mirrored by the local backend
    pub root: Option<PathBuf>,
}

/// Remote drive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Folder id that plays the role of the sync root ("root" = drive root)
    pub root_folder_id: String,
    pub api_base: String,
    pub upload_base: String,
    /// OAuth bearer token; usually supplied through `TANDEM_DRIVE_TOKEN`
    pub access_token: Option<String>,
    /// Cursor to resume from; takes precedence over `cursor_file`
    pub start_cursor: Option<String>,
    /// Where the poll loop persists its cursor
    pub cursor_file: Option<PathBuf>,
    /// Sleep between change pages
    pub poll_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root_folder_id: "root".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            access_token: None,
            start_cursor: None,
            cursor_file: None,
            poll_interval_ms: 1000,
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Staleness and echo suppression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tolerance added to timestamp comparisons (clock skew, latency)
    pub grace_window_secs: u64,
    /// How long a delivered path stays suppressed on its target backend
    pub echo_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 5,
            echo_ttl_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }

    pub fn echo_ttl(&self) -> Duration {
        Duration::from_secs(self.echo_ttl_secs)
    }
}

/// Exponential backoff for rate-limited remote requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay; each retry doubles it
    pub base_ms: u64,
    /// Retries before the rate-limit error is surfaced
    pub max_retries: u32,
    /// Ceiling for a single delay; must leave room for every retry to double
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_retries: 8,
            max_delay_ms: 128_000,
        }
    }
}

impl SyncConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: SyncConfig =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// `~/.config/tandem/config.toml` (platform equivalent)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tandem")
            .join("config.toml")
    }

    /// Fill the access token from `TANDEM_DRIVE_TOKEN` when the file has none
    pub fn with_env_overrides(mut self) -> Self {
        if self.remote.access_token.is_none() {
            self.remote.access_token = std::env::var("TANDEM_DRIVE_TOKEN").ok();
        }
        self
    }

    fn expand_paths(&mut self) {
        if let Some(root) = self.local.root.take() {
            self.local.root = Some(expand(&root));
        }
        if let Some(file) = self.remote.cursor_file.take() {
            self.remote.cursor_file = Some(expand(&file));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.remote.root_folder_id.trim().is_empty() {
            return Err(SyncError::Config(
                "remote.root_folder_id must not be empty".to_string(),
            ));
        }
        if self.remote.poll_interval_ms == 0 {
            return Err(SyncError::Config(
                "remote.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.backoff.base_ms == 0 {
            return Err(SyncError::Config(
                "backoff.base_ms must be positive".to_string(),
            ));
        }
        if let Some(last) = self.backoff.max_retries.checked_sub(1) {
            let longest = 1u64
                .checked_shl(last)
                .and_then(|factor| self.backoff.base_ms.checked_mul(factor));
            if longest.map_or(true, |longest| longest > self.backoff.max_delay_ms) {
                return Err(SyncError::Config(format!(
                    "backoff.max_delay_ms must be at least base_ms * 2^{last} so every retry waits longer"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `~` in a configured path
pub fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).to_string())
}
