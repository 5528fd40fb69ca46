use std::{future::Future, time::Duration};
use tokio::time::Instant;

use crate::constants::{
    ADAPTIVE_LONG_IDLE_SECS, ADAPTIVE_MAX_INTERVAL_MS, ADAPTIVE_MIN_INTERVAL_MS,
    ADAPTIVE_SHORT_IDLE_SECS, SYNC_RETRY_BASE_MS, SYNC_RETRY_CEILING_MS, SYNC_RETRY_COUNT,
};

use super::source::SyncError;

/// Exponential backoff for sync reads: the delay doubles per attempt and
/// never exceeds `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(SYNC_RETRY_BASE_MS),
            ceiling: Duration::from_millis(SYNC_RETRY_CEILING_MS),
            max_attempts: SYNC_RETRY_COUNT,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Runs `op` until it succeeds, fails terminally, or attempts run out.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err @ SyncError::Terminal(_)) => return Err(err),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        "Sync read attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Polling interval that widens while the user is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveInterval {
    pub min: Duration,
    pub max: Duration,
}

impl Default for AdaptiveInterval {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(ADAPTIVE_MIN_INTERVAL_MS),
            max: Duration::from_millis(ADAPTIVE_MAX_INTERVAL_MS),
        }
    }
}

impl AdaptiveInterval {
    pub fn interval(&self, last_activity: Instant, now: Instant) -> Duration {
        let idle = now.saturating_duration_since(last_activity);
        if idle < Duration::from_secs(ADAPTIVE_SHORT_IDLE_SECS) {
            self.min
        } else if idle < Duration::from_secs(ADAPTIVE_LONG_IDLE_SECS) {
            (self.min * 2).min(self.max)
        } else {
            self.max
        }
    }
}
