//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::domain::ConfigError;

/// Dispatcher settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Tick period.
    pub dispatch_interval_ms: u64,

    /// Maximum records claimed per tick.
    pub batch_size: usize,

    /// Retry delays; a failure after the last one is terminal.
    pub backoff_series_ms: Vec<u64>,

    /// Per-handler execution limit. `None` waits forever.
    pub handler_timeout_ms: Option<u64>,

    /// Claims older than this are released back to the queue.
    pub claim_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1_000,
            batch_size: 100,
            backoff_series_ms: vec![1_000, 5_000, 30_000, 120_000, 600_000],
            handler_timeout_ms: None,
            claim_timeout_ms: 300_000,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.claim_timeout_ms == 0 {
            return Err(ConfigError::ZeroClaimTimeout);
        }
        if let Some(handler_ms) = self.handler_timeout_ms
            && handler_ms >= self.claim_timeout_ms
        {
            return Err(ConfigError::HandlerTimeoutTooLong {
                handler_ms,
                claim_ms: self.claim_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(&self.backoff_series_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}
