//! SQLite outbox store.
//!
//! Claims are a single `UPDATE .. RETURNING` statement, which SQLite runs
//! under its database write lock, so concurrent dispatchers never claim the
//! same record twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::CLAIM_EXPIRED;
use super::sql::{COLUMNS, RecordRow, SNAPSHOT_COUNTS, insert_error, millis, payload_text, tally};
use crate::backoff::BackoffPolicy;
use crate::domain::{
    Envelope, FailOutcome, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus, StoreError,
};
use crate::ports::{Clock, OutboxStore, OutboxWriter, SystemClock};

/// The producer's transaction.
pub type SqliteUnitOfWork = Transaction<'static, Sqlite>;

#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool, backoff: BackoffPolicy) -> Self {
        Self {
            pool,
            backoff,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for `created_at` of enqueued records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                dedup_key TEXT NOT NULL UNIQUE,
                occurred_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                claimed_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_records_due
            ON outbox_records(status, next_attempt_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Start a unit of work. Records enqueued into it exist once it commits.
    pub async fn begin(&self) -> Result<SqliteUnitOfWork, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn load(
        conn: &mut SqliteConnection,
        id: OutboxId,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_records WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(to_record).transpose()
    }

    /// Persist a transition out of `Claimed` computed by `OutboxRecord`.
    async fn store_transition(
        conn: &mut SqliteConnection,
        record: &OutboxRecord,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = ?, next_attempt_at = ?, claimed_at = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'CLAIMED'
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.next_attempt_at.map(millis))
        .bind(record.claimed_at.map(millis))
        .bind(record.last_error.as_deref())
        .bind(millis(record.updated_at))
        .bind(record.id.get())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Unavailable(format!(
                "outbox record {} changed concurrently",
                record.id
            )));
        }
        Ok(())
    }
}

fn record_row(row: &SqliteRow) -> Result<RecordRow, sqlx::Error> {
    Ok(RecordRow {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        dedup_key: row.try_get("dedup_key")?,
        occurred_at: row.try_get("occurred_at")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_at: row.try_get("claimed_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn to_record(row: &SqliteRow) -> Result<OutboxRecord, StoreError> {
    record_row(row)?.into_record()
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl OutboxWriter for SqliteOutboxStore {
    type UnitOfWork = SqliteUnitOfWork;

    async fn enqueue(
        &self,
        envelope: Envelope,
        uow: &mut SqliteUnitOfWork,
    ) -> Result<(), StoreError> {
        let now = millis(self.clock.now());
        sqlx::query(
            r#"
            INSERT INTO outbox_records
            (event_type, payload, dedup_key, occurred_at, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
            "#,
        )
        .bind(envelope.event_type().as_str())
        .bind(payload_text(&envelope))
        .bind(envelope.dedup_key().as_str())
        .bind(millis(envelope.occurred_at()))
        .bind(now)
        .bind(now)
        .execute(&mut **uow)
        .await
        .map_err(|e| insert_error(e, envelope.dedup_key()))?;

        debug!(
            event_type = %envelope.event_type(),
            dedup_key = %envelope.dedup_key(),
            "staged outbox record"
        );
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let now_ms = millis(now);
        let sql = format!(
            r#"
            UPDATE outbox_records
            SET status = 'CLAIMED', attempts = attempts + 1, claimed_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM outbox_records
                WHERE status IN ('PENDING', 'FAILED_RETRYABLE')
                AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                ORDER BY id
                LIMIT ?
            )
            RETURNING {COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now_ms)
            .bind(now_ms)
            .bind(now_ms)
            .bind(sql_limit(batch_size))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not guarantee order.
        let mut records = rows.iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn ack(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::load(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if record.mark_dispatched(now)? {
            Self::store_transition(&mut tx, &record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fail(
        &self,
        id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::load(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let decision = self.backoff.decide(record.attempts);
        let outcome = record.record_failure(decision, error, now)?;
        Self::store_transition(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn release_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let now_ms = millis(now);
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'FAILED_RETRYABLE',
                next_attempt_at = ?,
                claimed_at = NULL,
                last_error = ?,
                updated_at = ?
            WHERE status = 'CLAIMED' AND claimed_at < ?
            "#,
        )
        .bind(now_ms)
        .bind(CLAIM_EXPIRED)
        .bind(now_ms)
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released expired outbox claims (sqlite)");
        }
        Ok(released)
    }

    async fn snapshot(&self) -> Result<OutboxSnapshot, StoreError> {
        let counts: Vec<(String, i64)> = sqlx::query_as(SNAPSHOT_COUNTS)
            .fetch_all(&self.pool)
            .await?;
        Ok(tally(counts))
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    async fn terminal(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_records WHERE status = ? ORDER BY id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(RecordStatus::FailedTerminal.as_str())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use chrono::{TimeDelta, TimeZone};
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::collections::HashSet;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    async fn store(series_ms: &[u64]) -> SqliteOutboxStore {
        // A single connection that never idles out keeps the in-memory
        // database alive for the whole test.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteOutboxStore::new(pool, BackoffPolicy::from_millis(series_ms));
        store.init_schema().await.unwrap();
        store
    }

    fn envelope(key: &str) -> Envelope {
        Envelope::new(
            EventType::EnrollmentCreated,
            serde_json::json!({"enrollment_id": key}),
            key,
            t0(),
        )
    }

    async fn commit(store: &SqliteOutboxStore, keys: &[&str]) {
        let mut uow = store.begin().await.unwrap();
        for key in keys {
            store.enqueue(envelope(key), &mut uow).await.unwrap();
        }
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_staged_records() {
        let store = store(&[50]).await;

        let mut uow = store.begin().await.unwrap();
        store.enqueue(envelope("enr-1"), &mut uow).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(store.snapshot().await.unwrap(), OutboxSnapshot::default());
        assert!(store.claim_due(10, t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_dedup_key_is_rejected() {
        let store = store(&[50]).await;
        commit(&store, &["enr-1"]).await;

        let mut uow = store.begin().await.unwrap();
        let err = store.enqueue(envelope("enr-1"), &mut uow).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDedupKey(k) if k.as_str() == "enr-1"));
        uow.rollback().await.unwrap();

        assert_eq!(store.snapshot().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn claim_roundtrips_the_envelope_in_id_order() {
        let store = store(&[50]).await;
        commit(&store, &["a", "b", "c"]).await;

        let claimed = store.claim_due(2, t0()).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(claimed[0].status, RecordStatus::Claimed);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].claimed_at, Some(t0()));
        assert_eq!(claimed[0].envelope, envelope("a"));

        let rest = store.claim_due(10, t0()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].envelope.dedup_key().as_str(), "c");
    }

    #[tokio::test]
    async fn ack_then_ack_again() {
        let store = store(&[50]).await;
        commit(&store, &["a"]).await;
        let id = store.claim_due(1, t0()).await.unwrap()[0].id;

        store.ack(id, t0()).await.unwrap();
        store.ack(id, t0()).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Dispatched);
        assert_eq!(store.snapshot().await.unwrap(), OutboxSnapshot::default());
    }

    #[tokio::test]
    async fn ack_of_pending_record_is_an_invalid_transition() {
        let store = store(&[50]).await;
        commit(&store, &["a"]).await;

        let err = store.ack(OutboxId::new(1), t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let err = store.ack(OutboxId::new(99), t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failures_back_off_then_turn_terminal() {
        let store = store(&[50]).await;
        commit(&store, &["a"]).await;

        let id = store.claim_due(1, t0()).await.unwrap()[0].id;
        let outcome = store.fail(id, "smtp down", t0()).await.unwrap();
        let retry_at = t0() + TimeDelta::milliseconds(50);
        assert_eq!(outcome, FailOutcome::Retry { next_attempt_at: retry_at });
        assert!(store.claim_due(1, t0()).await.unwrap().is_empty());

        let again = store.claim_due(1, retry_at).await.unwrap();
        assert_eq!(again[0].attempts, 2);
        assert_eq!(again[0].last_error.as_deref(), Some("smtp down"));
        assert_eq!(store.fail(id, "still down", retry_at).await.unwrap(), FailOutcome::Terminal);

        assert_eq!(store.snapshot().await.unwrap(), OutboxSnapshot { queued: 0, failed: 1 });
        let terminal = store.terminal(5).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].last_error.as_deref(), Some("still down"));
    }

    #[tokio::test]
    async fn expired_claims_return_to_the_queue() {
        let store = store(&[50]).await;
        commit(&store, &["a", "b"]).await;
        store.claim_due(2, t0()).await.unwrap();
        let later = t0() + TimeDelta::minutes(10);

        let released = store.release_expired(later, later).await.unwrap();
        assert_eq!(released, 2);

        let record = store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::FailedRetryable);
        assert_eq!(record.next_attempt_at, Some(later));
        assert_eq!(record.last_error.as_deref(), Some(CLAIM_EXPIRED));
        assert_eq!(store.claim_due(10, later).await.unwrap().len(), 2);

        // Expiry alone never ends a record, however many claims it took.
        let much_later = later + TimeDelta::minutes(10);
        assert_eq!(store.release_expired(much_later, much_later).await.unwrap(), 2);
        assert_eq!(store.snapshot().await.unwrap(), OutboxSnapshot { queued: 2, failed: 0 });
        let record = store.get(OutboxId::new(2)).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::FailedRetryable);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_on_a_shared_file_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("outbox.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        let store = SqliteOutboxStore::new(pool, BackoffPolicy::from_millis(&[50]));
        store.init_schema().await.unwrap();

        let keys: Vec<String> = (0..40).map(|i| format!("k-{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        commit(&store, &refs).await;

        let mut joins = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_due(3, t0()).await.unwrap();
                    if batch.is_empty() {
                        return mine;
                    }
                    mine.extend(batch.into_iter().map(|r| r.id));
                }
            }));
        }

        let mut seen = HashSet::new();
        for join in joins {
            for id in join.await.unwrap() {
                assert!(seen.insert(id), "record {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 40);
        assert_eq!(store.snapshot().await.unwrap().queued, 40);
    }
}
