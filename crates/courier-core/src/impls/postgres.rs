//! PostgreSQL outbox store.
//!
//! Claims lock their rows with `FOR UPDATE SKIP LOCKED`, so dispatchers on
//! different hosts split the queue without waiting on each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::CLAIM_EXPIRED;
use super::sql::{COLUMNS, RecordRow, SNAPSHOT_COUNTS, insert_error, millis, payload_text, tally};
use crate::backoff::BackoffPolicy;
use crate::domain::{
    Envelope, FailOutcome, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus, StoreError,
};
use crate::ports::{Clock, OutboxStore, OutboxWriter, SystemClock};

/// The producer's transaction.
pub type PgUnitOfWork = Transaction<'static, Postgres>;

#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self {
            pool,
            backoff,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_records (
                id BIGSERIAL PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                dedup_key TEXT NOT NULL UNIQUE,
                occurred_at BIGINT NOT NULL,
                status TEXT NOT NULL,
                attempts BIGINT NOT NULL DEFAULT 0,
                next_attempt_at BIGINT,
                claimed_at BIGINT,
                last_error TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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

    pub async fn begin(&self) -> Result<PgUnitOfWork, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn load_for_update(
        conn: &mut PgConnection,
        id: OutboxId,
    ) -> Result<Option<OutboxRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_records WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(to_record).transpose()
    }

    async fn store_transition(
        conn: &mut PgConnection,
        record: &OutboxRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = $1, next_attempt_at = $2, claimed_at = $3, last_error = $4, updated_at = $5
            WHERE id = $6
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
        Ok(())
    }
}

fn record_row(row: &PgRow) -> Result<RecordRow, sqlx::Error> {
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

fn to_record(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    record_row(row)?.into_record()
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl OutboxWriter for PostgresOutboxStore {
    type UnitOfWork = PgUnitOfWork;

    async fn enqueue(&self, envelope: Envelope, uow: &mut PgUnitOfWork) -> Result<(), StoreError> {
        let now = millis(self.clock.now());
        sqlx::query(
            r#"
            INSERT INTO outbox_records
            (event_type, payload, dedup_key, occurred_at, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $5)
            "#,
        )
        .bind(envelope.event_type().as_str())
        .bind(payload_text(&envelope))
        .bind(envelope.dedup_key().as_str())
        .bind(millis(envelope.occurred_at()))
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
impl OutboxStore for PostgresOutboxStore {
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

        let sql = format!(
            r#"
            WITH due AS (
                SELECT id FROM outbox_records
                WHERE status IN ('PENDING', 'FAILED_RETRYABLE')
                AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_records o
            SET status = 'CLAIMED', attempts = o.attempts + 1, claimed_at = $1, updated_at = $1
            FROM due
            WHERE o.id = due.id
            RETURNING {}
            "#,
            qualified_columns("o")
        );
        let rows = sqlx::query(&sql)
            .bind(millis(now))
            .bind(sql_limit(batch_size))
            .fetch_all(&self.pool)
            .await?;

        let mut records = rows.iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn ack(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::load_for_update(&mut tx, id)
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
        let mut record = Self::load_for_update(&mut tx, id)
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
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'FAILED_RETRYABLE',
                next_attempt_at = $1,
                claimed_at = NULL,
                last_error = $2,
                updated_at = $1
            WHERE status = 'CLAIMED' AND claimed_at < $3
            "#,
        )
        .bind(millis(now))
        .bind(CLAIM_EXPIRED)
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released expired outbox claims (postgres)");
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
        let sql = format!("SELECT {COLUMNS} FROM outbox_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(to_record).transpose()
    }

    async fn terminal(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_records WHERE status = $1 ORDER BY id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(RecordStatus::FailedTerminal.as_str())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(to_record).collect()
    }
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_columns_are_qualified() {
        let cols = qualified_columns("o");
        assert!(cols.starts_with("o.id, o.event_type, o.payload"));
        assert!(cols.ends_with("o.updated_at"));
        assert!(!cols.contains("  "));
    }
}
