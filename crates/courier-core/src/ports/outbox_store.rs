//! Outbox store ports.
//!
//! The store is the only shared mutable resource of the dispatcher. It is
//! split in two seams:
//! - [`OutboxWriter`]: used by producers, inside their own transaction.
//! - [`OutboxStore`]: used by the dispatcher (claim/ack/fail) and by health
//!   checks (snapshot). Object-safe so it can live behind `Arc<dyn _>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backoff::BackoffPolicy;
use crate::domain::{
    Envelope, FailOutcome, OutboxId, OutboxRecord, OutboxSnapshot, StoreError,
};

/// Producer-facing side of the outbox.
#[async_trait]
pub trait OutboxWriter: Send + Sync {
    /// The caller's transaction. The record exists iff it commits.
    type UnitOfWork: Send;

    /// Stage a `Pending` record inside `uow`.
    ///
    /// Storage errors, including a duplicate dedup key, are returned to the
    /// caller, who is expected to roll the unit of work back.
    async fn enqueue(
        &self,
        envelope: Envelope,
        uow: &mut Self::UnitOfWork,
    ) -> Result<(), StoreError>;
}

/// Dispatcher-facing side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Policy `fail` applies.
    fn backoff(&self) -> &BackoffPolicy;

    /// Claim up to `batch_size` due records (`Pending` or `FailedRetryable`
    /// with `next_attempt_at <= now`), ordered by id ascending.
    ///
    /// A claimed record is invisible to every other caller until it is
    /// acked, failed, or released.
    async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Claimed -> Dispatched. Acking a dispatched record is a no-op.
    async fn ack(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Claimed -> FailedRetryable (per the backoff policy) or FailedTerminal.
    async fn fail(
        &self,
        id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError>;

    /// Return claims taken before `cutoff` to the queue.
    ///
    /// Released records become `FailedRetryable`, claimable at `now`, and
    /// keep their attempt count. A release never makes a record terminal;
    /// only `fail` after an actual delivery does. Returns the number released.
    async fn release_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Queued / terminally failed counts.
    async fn snapshot(&self) -> Result<OutboxSnapshot, StoreError>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError>;

    /// Terminally failed records in id order, for operator inspection.
    async fn terminal(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;
}
