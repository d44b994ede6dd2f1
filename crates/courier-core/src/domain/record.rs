//! Outbox record: an envelope plus its delivery bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::errors::StoreError;
use crate::backoff::RetryDecision;

/// Surrogate key assigned at enqueue time.
///
/// Monotonically increasing, so it also defines FIFO order within a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(i64);

impl OutboxId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery state of a record.
///
/// State transitions:
/// - Pending -> Claimed -> Dispatched
/// - Pending -> Claimed -> FailedRetryable -> (due again) -> Claimed -> ...
/// - Pending -> Claimed -> FailedTerminal
///
/// Dispatched and FailedTerminal are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Claimed,
    Dispatched,
    FailedRetryable,
    FailedTerminal,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Claimed => "CLAIMED",
            RecordStatus::Dispatched => "DISPATCHED",
            RecordStatus::FailedRetryable => "FAILED_RETRYABLE",
            RecordStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    /// Counted in `OutboxSnapshot::queued`.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            RecordStatus::Pending | RecordStatus::Claimed | RecordStatus::FailedRetryable
        )
    }

    /// No further transitions.
    pub fn is_final(self) -> bool {
        matches!(self, RecordStatus::Dispatched | RecordStatus::FailedTerminal)
    }

    /// Eligible for `claim_due` once `next_attempt_at` has passed.
    pub fn is_claimable(self) -> bool {
        matches!(self, RecordStatus::Pending | RecordStatus::FailedRetryable)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecordStatus::Pending),
            "CLAIMED" => Ok(RecordStatus::Claimed),
            "DISPATCHED" => Ok(RecordStatus::Dispatched),
            "FAILED_RETRYABLE" => Ok(RecordStatus::FailedRetryable),
            "FAILED_TERMINAL" => Ok(RecordStatus::FailedTerminal),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// What `fail` did with a claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue, claimable from `next_attempt_at`.
    Retry { next_attempt_at: DateTime<Utc> },

    /// Backoff series exhausted; kept for inspection.
    Terminal,
}

/// Aggregate counters for health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxSnapshot {
    /// Pending, claimed, or waiting for a retry.
    pub queued: u64,

    /// Terminally failed.
    pub failed: u64,
}

/// Persisted wrapper around an envelope.
///
/// All state transitions go through the methods below; stores that keep
/// records in memory call them under their lock, SQL stores mirror them in
/// their UPDATE statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub envelope: Envelope,
    pub status: RecordStatus,

    /// Delivery attempts so far (incremented on each claim).
    pub attempts: u32,

    /// Earliest time of the next claim. `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Set while the record is claimed.
    pub claimed_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(id: OutboxId, envelope: Envelope, now: DateTime<Utc>) -> Self {
        Self {
            id,
            envelope,
            status: RecordStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Pending/FailedRetryable -> Claimed. Counts one attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.status.is_claimable() {
            return Err(self.invalid(RecordStatus::Claimed));
        }
        self.status = RecordStatus::Claimed;
        self.attempts += 1;
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Claimed -> Dispatched.
    ///
    /// Returns `false` when the record was already dispatched (no-op).
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.status {
            RecordStatus::Dispatched => Ok(false),
            RecordStatus::Claimed => {
                self.status = RecordStatus::Dispatched;
                self.claimed_at = None;
                self.next_attempt_at = None;
                self.updated_at = now;
                Ok(true)
            }
            _ => Err(self.invalid(RecordStatus::Dispatched)),
        }
    }

    /// Claimed -> FailedRetryable or FailedTerminal, per the backoff decision.
    pub fn record_failure(
        &mut self,
        decision: RetryDecision,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let target = match decision {
            RetryDecision::Retry(_) => RecordStatus::FailedRetryable,
            RetryDecision::Exhausted => RecordStatus::FailedTerminal,
        };
        if self.status != RecordStatus::Claimed {
            return Err(self.invalid(target));
        }

        self.status = target;
        self.claimed_at = None;
        self.last_error = Some(error.into());
        self.updated_at = now;

        match decision {
            RetryDecision::Retry(delay) => {
                let next_attempt_at = crate::backoff::instant_after(now, delay);
                self.next_attempt_at = Some(next_attempt_at);
                Ok(FailOutcome::Retry { next_attempt_at })
            }
            RetryDecision::Exhausted => {
                self.next_attempt_at = None;
                Ok(FailOutcome::Terminal)
            }
        }
    }

    /// Claimed -> FailedRetryable, due at `now`, for a claim whose owner went
    /// away.
    ///
    /// Never terminal: nothing is known about whether the handlers ran, so
    /// only `record_failure` after a real attempt may end the record.
    /// `attempts` is kept, so the next failure still sees every claim.
    pub fn release(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.status != RecordStatus::Claimed {
            return Err(self.invalid(RecordStatus::FailedRetryable));
        }
        self.status = RecordStatus::FailedRetryable;
        self.claimed_at = None;
        self.next_attempt_at = Some(now);
        self.last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    fn invalid(&self, target: RecordStatus) -> StoreError {
        StoreError::InvalidTransition {
            id: self.id,
            actual: self.status,
            target,
        }
    }
}
