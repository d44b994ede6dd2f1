//! In-memory outbox store.
//!
//! Used by tests and the demo binary. A single async mutex makes claims
//! atomic across any number of concurrent dispatchers sharing the store;
//! snapshot counters are atomics so health checks never wait on that lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::domain::{
    DedupKey, Envelope, FailOutcome, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus,
    StoreError,
};
use super::CLAIM_EXPIRED;
use crate::ports::{OutboxStore, OutboxWriter};

/// Unit of work for the in-memory store.
///
/// Envelopes are staged here and become records only on
/// [`InMemoryOutboxStore::commit`]. Dropping it is a rollback.
#[derive(Debug, Default)]
pub struct MemoryUnitOfWork {
    staged: Vec<Envelope>,
}

impl MemoryUnitOfWork {
    pub fn staged(&self) -> &[Envelope] {
        &self.staged
    }

    pub fn rollback(self) {}
}

struct InMemoryOutboxState {
    /// All records, ordered by id.
    records: BTreeMap<OutboxId, OutboxRecord>,

    /// Dedup keys of every committed record.
    dedup_keys: HashSet<DedupKey>,

    next_id: i64,
}

impl InMemoryOutboxState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            dedup_keys: HashSet::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> OutboxId {
        let id = OutboxId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn record_mut(&mut self, id: OutboxId) -> Result<&mut OutboxRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn terminal(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory outbox store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<InMemoryOutboxState>>,
    counters: Arc<Counters>,
    backoff: BackoffPolicy,
}

impl InMemoryOutboxStore {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryOutboxState::new())),
            counters: Arc::new(Counters::default()),
            backoff,
        }
    }

    /// Start a unit of work.
    pub fn begin(&self) -> MemoryUnitOfWork {
        MemoryUnitOfWork::default()
    }

    /// Turn every staged envelope into a `Pending` record, or none of them.
    pub async fn commit(
        &self,
        uow: MemoryUnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxId>, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(dup) = uow
            .staged
            .iter()
            .find(|e| state.dedup_keys.contains(e.dedup_key()))
        {
            return Err(StoreError::DuplicateDedupKey(dup.dedup_key().clone()));
        }

        let mut ids = Vec::with_capacity(uow.staged.len());
        for envelope in uow.staged {
            let id = state.allocate_id();
            state.dedup_keys.insert(envelope.dedup_key().clone());
            state.records.insert(id, OutboxRecord::new(id, envelope, now));
            ids.push(id);
        }
        self.counters
            .queued
            .fetch_add(ids.len() as u64, Ordering::Relaxed);

        debug!(count = ids.len(), "committed outbox records");
        Ok(ids)
    }

    /// All records in id order (for tests and inspection).
    pub async fn records(&self) -> Vec<OutboxRecord> {
        let state = self.state.lock().await;
        state.records.values().cloned().collect()
    }
}

#[async_trait]
impl OutboxWriter for InMemoryOutboxStore {
    type UnitOfWork = MemoryUnitOfWork;

    async fn enqueue(
        &self,
        envelope: Envelope,
        uow: &mut MemoryUnitOfWork,
    ) -> Result<(), StoreError> {
        let key = envelope.dedup_key();
        let committed = self.state.lock().await.dedup_keys.contains(key);
        if committed || uow.staged.iter().any(|e| e.dedup_key() == key) {
            return Err(StoreError::DuplicateDedupKey(key.clone()));
        }
        uow.staged.push(envelope);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        for record in state.records.values_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            if record.is_due(now) {
                record.claim(now)?;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.record_mut(id)?.mark_dispatched(now)? {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        let decision = self.backoff.decide(record.attempts);
        let outcome = record.record_failure(decision, error, now)?;
        if outcome == FailOutcome::Terminal {
            self.counters.terminal();
        }
        Ok(outcome)
    }

    async fn release_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for record in state.records.values_mut() {
            let expired = record.status == RecordStatus::Claimed
                && record.claimed_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            record.release(CLAIM_EXPIRED, now)?;
            released += 1;
        }
        Ok(released)
    }

    async fn snapshot(&self) -> Result<OutboxSnapshot, StoreError> {
        Ok(OutboxSnapshot {
            queued: self.counters.queued.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        })
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn terminal(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.status == RecordStatus::FailedTerminal)
            .take(limit)
            .cloned()
            .collect())
    }
}
