//! Academy demo: an enrollment producer and two downstream handlers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_core::impls::SqliteOutboxStore;
use courier_core::{
    Clock, Envelope, EventType, HandlerError, InMemoryOutboxStore, IntegrationEventHandler,
    OutboxWriter, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentCreated {
    pub enrollment_id: String,
    pub student_id: String,
    pub course_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentCancelled {
    pub enrollment_id: String,
    pub course_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: String,
    pub course_id: String,
    pub attendees: u32,
}

/// Where the producer writes its business rows and events.
pub enum Backend {
    Memory(InMemoryOutboxStore),
    Sqlite(SqliteOutboxStore),
}

/// Enrollment use cases. Each one writes its event through the outbox in
/// the same unit of work as the business change.
pub struct Academy<C> {
    backend: Backend,
    clock: C,
    /// (student, course) -> enrollment id, for the in-memory backend.
    enrollments: Mutex<HashMap<(String, String), String>>,
}

impl<C: Clock> Academy<C> {
    pub fn new(backend: Backend, clock: C) -> Self {
        Self {
            backend,
            clock,
            enrollments: Mutex::new(HashMap::new()),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        if let Backend::Sqlite(store) = &self.backend {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS enrollments (
                    id TEXT PRIMARY KEY,
                    student_id TEXT NOT NULL,
                    course_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    UNIQUE (student_id, course_id)
                )
                "#,
            )
            .execute(store.pool())
            .await?;
        }
        Ok(())
    }

    /// Enroll a student. Enrolling twice returns the first enrollment and
    /// emits nothing.
    pub async fn enroll(&self, student_id: &str, course_id: &str) -> Result<String> {
        let enrollment_id = Ulid::new().to_string();
        let payload = EnrollmentCreated {
            enrollment_id: enrollment_id.clone(),
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
        };
        let envelope = Envelope::from_payload(
            EventType::EnrollmentCreated,
            &payload,
            format!("enrollment:{enrollment_id}:created"),
            self.clock.now(),
        )?;

        match &self.backend {
            Backend::Memory(store) => {
                let key = (student_id.to_string(), course_id.to_string());
                if let Some(existing) = self.lock_enrollments().get(&key) {
                    info!(student_id, course_id, "already enrolled");
                    return Ok(existing.clone());
                }
                let mut uow = store.begin();
                store.enqueue(envelope, &mut uow).await?;
                store.commit(uow, self.clock.now()).await?;
                self.lock_enrollments().insert(key, enrollment_id.clone());
            }
            Backend::Sqlite(store) => {
                let mut tx = store.begin().await?;
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO enrollments (id, student_id, course_id, status)
                    VALUES (?, ?, ?, 'ACTIVE')
                    ON CONFLICT (student_id, course_id) DO NOTHING
                    "#,
                )
                .bind(&enrollment_id)
                .bind(student_id)
                .bind(course_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if inserted == 0 {
                    let existing: String = sqlx::query_scalar(
                        "SELECT id FROM enrollments WHERE student_id = ? AND course_id = ?",
                    )
                    .bind(student_id)
                    .bind(course_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    tx.rollback().await?;
                    info!(student_id, course_id, "already enrolled");
                    return Ok(existing);
                }

                store.enqueue(envelope, &mut tx).await?;
                tx.commit().await?;
            }
        }

        info!(%enrollment_id, student_id, course_id, "enrolled");
        Ok(enrollment_id)
    }

    pub async fn cancel(&self, enrollment_id: &str, course_id: &str) -> Result<()> {
        let payload = EnrollmentCancelled {
            enrollment_id: enrollment_id.to_string(),
            course_id: course_id.to_string(),
        };
        let envelope = Envelope::from_payload(
            EventType::EnrollmentCancelled,
            &payload,
            format!("enrollment:{enrollment_id}:cancelled"),
            self.clock.now(),
        )?;

        match &self.backend {
            Backend::Memory(store) => {
                let mut uow = store.begin();
                store.enqueue(envelope, &mut uow).await?;
                store.commit(uow, self.clock.now()).await?;
                self.lock_enrollments().retain(|_, id| id.as_str() != enrollment_id);
            }
            Backend::Sqlite(store) => {
                let mut tx = store.begin().await?;
                sqlx::query("UPDATE enrollments SET status = 'CANCELLED' WHERE id = ?")
                    .bind(enrollment_id)
                    .execute(&mut *tx)
                    .await?;
                store.enqueue(envelope, &mut tx).await?;
                tx.commit().await?;
            }
        }

        info!(enrollment_id, "enrollment cancelled");
        Ok(())
    }

    /// Emit an event that has no business row of its own.
    pub async fn publish(&self, envelope: Envelope) -> Result<()> {
        let dedup_key = envelope.dedup_key().clone();
        let result = match &self.backend {
            Backend::Memory(store) => {
                let mut uow = store.begin();
                store.enqueue(envelope, &mut uow).await?;
                store.commit(uow, self.clock.now()).await.map(|_| ())
            }
            Backend::Sqlite(store) => {
                let mut tx = store.begin().await?;
                store.enqueue(envelope, &mut tx).await?;
                tx.commit().await.map_err(StoreError::from)
            }
        };
        result.with_context(|| format!("publishing {dedup_key}"))
    }

    fn lock_enrollments(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.enrollments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends the welcome mail. Fails its first `failures` calls to show retries.
pub struct WelcomeMailer {
    remaining_failures: AtomicU32,
}

impl WelcomeMailer {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl IntegrationEventHandler for WelcomeMailer {
    fn event_type(&self) -> EventType {
        EventType::EnrollmentCreated
    }

    fn name(&self) -> &str {
        "welcome-mailer"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let payload: EnrollmentCreated = envelope.payload_as()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!(
                "smtp relay refused connection (left={left})"
            )));
        }

        info!(
            student_id = %payload.student_id,
            course_id = %payload.course_id,
            "welcome mail sent"
        );
        Ok(())
    }
}

/// Seats taken per course. Remembers dedup keys so redelivery is harmless.
#[derive(Default)]
pub struct SeatLedger {
    seats: Mutex<HashMap<String, i64>>,
    applied: Mutex<HashSet<String>>,
}

impl SeatLedger {
    pub fn seats(&self) -> HashMap<String, i64> {
        self.seats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn apply(&self, envelope: &Envelope, course_id: &str, delta: i64) {
        let first_delivery = self
            .applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(envelope.dedup_key().to_string());
        if !first_delivery {
            info!(dedup_key = %envelope.dedup_key(), "seat change already applied");
            return;
        }
        *self
            .seats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(course_id.to_string())
            .or_default() += delta;
    }
}

/// Per-type view of a shared [`SeatLedger`].
pub struct SeatLedgerHandler {
    event_type: EventType,
    ledger: Arc<SeatLedger>,
}

impl SeatLedgerHandler {
    pub fn new(event_type: EventType, ledger: Arc<SeatLedger>) -> Self {
        Self { event_type, ledger }
    }
}

#[async_trait]
impl IntegrationEventHandler for SeatLedgerHandler {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn name(&self) -> &str {
        "seat-ledger"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.event_type() {
            EventType::EnrollmentCreated => {
                let payload: EnrollmentCreated = envelope.payload_as()?;
                self.ledger.apply(envelope, &payload.course_id, 1);
            }
            EventType::EnrollmentCancelled => {
                let payload: EnrollmentCancelled = envelope.payload_as()?;
                self.ledger.apply(envelope, &payload.course_id, -1);
            }
            other => {
                return Err(HandlerError::failed(format!(
                    "seat ledger does not handle {other}"
                )));
            }
        }
        Ok(())
    }
}
