//! Exponential backoff for rate-limited remote requests

use std::future::Future;
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::error::Result;

/// Doubling delays starting from `base`, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// The full delay schedule, one entry per allowed retry
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay(retry))
    }
}

/// Run `op`, retrying rate-limit failures with exponential backoff
///
/// Only [`SyncError::RateLimited`](crate::error::SyncError::RateLimited) is
/// retried. Once `max_retries` retries are spent the last rate-limit error is
/// returned; any other error is returned immediately.
pub async fn retry_rate_limited<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Err(e) if e.is_rate_limited() && retry < policy.max_retries => {
                let delay = policy.delay(retry);
                tracing::debug!(
                    operation = what,
                    retry = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            other => return other,
        }
    }
}
