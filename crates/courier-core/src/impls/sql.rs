//! Column mapping shared by the SQL stores.
//!
//! Timestamps are stored as epoch milliseconds, payloads as JSON text and
//! enums by their `SCREAMING_SNAKE_CASE` names.

use chrono::{DateTime, Utc};

use crate::domain::{
    DedupKey, Envelope, EventType, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus, StoreError,
};

pub(crate) const COLUMNS: &str = "id, event_type, payload, dedup_key, occurred_at, status, \
     attempts, next_attempt_at, claimed_at, last_error, created_at, updated_at";

/// One row of `outbox_records`, as read from the database.
pub(crate) struct RecordRow {
    pub id: i64,
    pub event_type: String,
    pub payload: String,
    pub dedup_key: String,
    pub occurred_at: i64,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_at: Option<i64>,
    pub claimed_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecordRow {
    pub fn into_record(self) -> Result<OutboxRecord, StoreError> {
        let id = OutboxId::new(self.id);
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };

        let event_type: EventType = self.event_type.parse().map_err(|e| corrupt(format!("{e}")))?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("invalid payload: {e}")))?;
        let status: RecordStatus = self.status.parse().map_err(corrupt)?;
        let attempts =
            u32::try_from(self.attempts).map_err(|_| corrupt(format!("attempts = {}", self.attempts)))?;

        let envelope = Envelope::new(
            event_type,
            payload,
            DedupKey::new(self.dedup_key),
            from_millis(id, self.occurred_at)?,
        );

        Ok(OutboxRecord {
            id,
            envelope,
            status,
            attempts,
            next_attempt_at: self.next_attempt_at.map(|ms| from_millis(id, ms)).transpose()?,
            claimed_at: self.claimed_at.map(|ms| from_millis(id, ms)).transpose()?,
            last_error: self.last_error,
            created_at: from_millis(id, self.created_at)?,
            updated_at: from_millis(id, self.updated_at)?,
        })
    }
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(id: OutboxId, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("invalid timestamp {ms}"),
    })
}

/// Per-status counts for `snapshot`. Dispatched rows are excluded so the
/// status index bounds the scan to live and failed records.
pub(crate) const SNAPSHOT_COUNTS: &str = "SELECT status, COUNT(*) FROM outbox_records \
     WHERE status IN ('PENDING', 'CLAIMED', 'FAILED_RETRYABLE', 'FAILED_TERMINAL') \
     GROUP BY status";

/// Fold `(status, count)` rows into a snapshot.
pub(crate) fn tally(counts: impl IntoIterator<Item = (String, i64)>) -> OutboxSnapshot {
    let mut snapshot = OutboxSnapshot::default();
    for (status, count) in counts {
        let count = u64::try_from(count).unwrap_or_default();
        match status.parse::<RecordStatus>() {
            Ok(RecordStatus::FailedTerminal) => snapshot.failed += count,
            Ok(status) if status.is_queued() => snapshot.queued += count,
            _ => {}
        }
    }
    snapshot
}

pub(crate) fn payload_text(envelope: &Envelope) -> String {
    envelope.payload().to_string()
}

/// Map an INSERT failure, turning a unique violation into a dedup conflict.
pub(crate) fn insert_error(err: sqlx::Error, key: &DedupKey) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateDedupKey(key.clone())
        }
        _ => StoreError::Database(err),
    }
}
