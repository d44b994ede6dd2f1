//! Backoff policy: decides retry delays and when to give up.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    Retry(Duration),

    /// Series exhausted, the failure is terminal.
    Exhausted,
}

/// Fixed, ordered series of retry delays.
///
/// The delay after the `n`th failed attempt is `series[n - 1]`. Once the
/// attempt count exceeds the series length the failure is terminal, so a
/// series of length `k` allows `k + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    series: Vec<Duration>,
}

impl BackoffPolicy {
    pub fn new(series: Vec<Duration>) -> Self {
        Self { series }
    }

    pub fn from_millis(series_ms: &[u64]) -> Self {
        Self::new(series_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Production default: 1s, 5s, 30s, 2min, 10min.
    pub fn default_series() -> Self {
        Self::from_millis(&[1_000, 5_000, 30_000, 120_000, 600_000])
    }

    pub fn series(&self) -> &[Duration] {
        &self.series
    }

    /// Number of retries before a failure becomes terminal.
    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.series.len()).unwrap_or(u32::MAX)
    }

    /// Decide the next step given the number of attempts already made
    /// (1-indexed). Zero is treated like the first attempt.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        let index = attempts.saturating_sub(1) as usize;
        match self.series.get(index) {
            Some(delay) => RetryDecision::Retry(*delay),
            None => RetryDecision::Exhausted,
        }
    }

    /// Sum of the first `k` delays: the least time `k` retries can take.
    pub fn total_delay(&self, k: usize) -> Duration {
        self.series.iter().take(k).sum()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::default_series()
    }
}

/// `now + delay`, saturating at the maximum representable time.
pub(crate) fn instant_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
