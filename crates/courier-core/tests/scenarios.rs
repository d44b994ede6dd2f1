//! End-to-end delivery scenarios over the in-memory store.
//!
//! Every test runs on a paused tokio clock: timers fire in virtual time, so
//! backoff delays are exact and the tests never sleep for real.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    BackoffPolicy, Clock, DispatcherBuilder, DispatcherConfig, DispatcherHandle, Envelope,
    EventType, HandlerError, InMemoryOutboxStore, IntegrationEventHandler, OutboxId,
    OutboxSnapshot, OutboxStore, OutboxWriter, RecordStatus, StoreError, TokioClock,
};
use rstest::rstest;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EnrollmentCreated {
    enrollment_id: String,
    student_id: String,
    course_id: String,
}

/// Records what it sees; fails its first `fail_first` calls.
struct Recorder {
    event_type: EventType,
    fail_first: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    succeeded_at: Mutex<Option<Instant>>,
}

impl Recorder {
    fn new(event_type: EventType, fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            event_type,
            fail_first,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            succeeded_at: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn succeeded_at(&self) -> Option<Instant> {
        *self.succeeded_at.lock().unwrap()
    }
}

#[async_trait]
impl IntegrationEventHandler for Recorder {
    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(envelope.dedup_key().to_string());
        if n < self.fail_first {
            return Err(HandlerError::failed("downstream unavailable"));
        }
        *self.succeeded_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum EnrollError {
    #[error("course {0} is full")]
    CourseFull(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Minimal producer: enrollment is idempotent per (student, course) and
/// writes its event through the outbox in the same unit of work.
struct Academy {
    store: InMemoryOutboxStore,
    clock: TokioClock,
    capacity: usize,
    enrollments: Mutex<HashMap<(String, String), String>>,
}

impl Academy {
    fn new(store: InMemoryOutboxStore, clock: TokioClock, capacity: usize) -> Self {
        Self {
            store,
            clock,
            capacity,
            enrollments: Mutex::new(HashMap::new()),
        }
    }

    async fn enroll(&self, student_id: &str, course_id: &str) -> Result<String, EnrollError> {
        let key = (student_id.to_string(), course_id.to_string());
        if let Some(existing) = self.enrollments.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let enrollment_id = format!("enr-{student_id}-{course_id}");
        let payload = EnrollmentCreated {
            enrollment_id: enrollment_id.clone(),
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
        };
        let envelope = Envelope::from_payload(
            EventType::EnrollmentCreated,
            &payload,
            format!("{enrollment_id}:created"),
            self.clock.now(),
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut uow = self.store.begin();
        self.store.enqueue(envelope, &mut uow).await?;

        // Business rule checked after the event is staged: a rejection must
        // leave nothing behind.
        let taken = self
            .enrollments
            .lock()
            .unwrap()
            .keys()
            .filter(|(_, c)| c == course_id)
            .count();
        if taken >= self.capacity {
            uow.rollback();
            return Err(EnrollError::CourseFull(course_id.to_string()));
        }

        self.store.commit(uow, self.clock.now()).await?;
        self.enrollments
            .lock()
            .unwrap()
            .insert(key, enrollment_id.clone());
        Ok(enrollment_id)
    }

    async fn cancel(&self, enrollment_id: &str) -> Result<(), EnrollError> {
        let envelope = Envelope::new(
            EventType::EnrollmentCancelled,
            serde_json::json!({ "enrollment_id": enrollment_id }),
            format!("{enrollment_id}:cancelled"),
            self.clock.now(),
        );
        let mut uow = self.store.begin();
        self.store.enqueue(envelope, &mut uow).await?;
        self.store.commit(uow, self.clock.now()).await?;
        Ok(())
    }
}

struct Harness {
    store: InMemoryOutboxStore,
    academy: Academy,
    handle: DispatcherHandle,
}

impl Harness {
    fn start(series_ms: &[u64], handlers: Vec<Arc<dyn IntegrationEventHandler>>) -> Self {
        Self::start_with_capacity(series_ms, handlers, usize::MAX)
    }

    fn start_with_capacity(
        series_ms: &[u64],
        handlers: Vec<Arc<dyn IntegrationEventHandler>>,
        capacity: usize,
    ) -> Self {
        let clock = TokioClock::new();
        let store = InMemoryOutboxStore::new(BackoffPolicy::from_millis(series_ms));
        let dispatcher = DispatcherBuilder::new(Arc::new(store.clone()))
            .handlers(handlers)
            .clock(Arc::new(clock))
            .config(DispatcherConfig {
                dispatch_interval_ms: INTERVAL_MS,
                backoff_series_ms: series_ms.to_vec(),
                ..DispatcherConfig::default()
            })
            .build()
            .unwrap();
        let handle = Arc::new(dispatcher).spawn();

        Self {
            academy: Academy::new(store.clone(), clock, capacity),
            store,
            handle,
        }
    }

    async fn snapshot(&self) -> OutboxSnapshot {
        self.store.snapshot().await.unwrap()
    }

    /// Let the loop run until nothing is queued (bounded).
    async fn settle(&self) {
        for _ in 0..200 {
            if self.snapshot().await.queued == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(INTERVAL_MS)).await;
        }
        panic!("outbox did not drain: {:?}", self.snapshot().await);
    }

    async fn stop(self) {
        self.handle.shutdown().await;
    }
}

fn handlers<const N: usize>(list: [Arc<Recorder>; N]) -> Vec<Arc<dyn IntegrationEventHandler>> {
    list.into_iter()
        .map(|h| h as Arc<dyn IntegrationEventHandler>)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn fresh_enrollment_is_delivered_once() {
    let recorder = Recorder::new(EventType::EnrollmentCreated, 0);
    let h = Harness::start(&[50, 50], handlers([recorder.clone()]));

    h.academy.enroll("stu-1", "rust-101").await.unwrap();
    tokio::time::sleep(Duration::from_millis(INTERVAL_MS + 1)).await;

    assert_eq!(recorder.calls(), 1);
    assert_eq!(recorder.seen(), vec!["enr-stu-1-rust-101:created"]);
    assert_eq!(h.snapshot().await, OutboxSnapshot { queued: 0, failed: 0 });
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_enrollment_enqueues_nothing() {
    let recorder = Recorder::new(EventType::EnrollmentCreated, 0);
    let h = Harness::start(&[50, 50], handlers([recorder.clone()]));

    let first = h.academy.enroll("stu-1", "rust-101").await.unwrap();
    h.settle().await;
    assert_eq!(recorder.calls(), 1);

    let second = h.academy.enroll("stu-1", "rust-101").await.unwrap();
    assert_eq!(first, second);
    tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 4)).await;

    assert_eq!(recorder.calls(), 1);
    assert_eq!(h.store.records().await.len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn handler_recovers_after_two_failures() {
    let recorder = Recorder::new(EventType::EnrollmentCreated, 2);
    let h = Harness::start(&[50, 50], handlers([recorder.clone()]));

    let enqueued_at = Instant::now();
    h.academy.enroll("stu-1", "rust-101").await.unwrap();
    h.settle().await;

    assert_eq!(recorder.calls(), 3);
    let elapsed = recorder.succeeded_at().unwrap() - enqueued_at;
    assert!(elapsed >= Duration::from_millis(100), "acked after {elapsed:?}");

    let record = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Dispatched);
    assert_eq!(record.attempts, 3);
    h.stop().await;
}

#[rstest]
#[case::one_failure(1)]
#[case::two_failures(2)]
#[case::three_failures(3)]
#[tokio::test(start_paused = true)]
async fn backoff_delays_are_respected(#[case] failures: usize) {
    let series = [50, 80, 120];
    let recorder = Recorder::new(EventType::EnrollmentCreated, failures);
    let h = Harness::start(&series, handlers([recorder.clone()]));

    let enqueued_at = Instant::now();
    h.academy.enroll("stu-1", "rust-101").await.unwrap();
    h.settle().await;

    let elapsed = recorder.succeeded_at().unwrap() - enqueued_at;
    let minimum = BackoffPolicy::from_millis(&series).total_delay(failures);
    assert!(elapsed >= minimum, "acked after {elapsed:?}, expected at least {minimum:?}");
    assert_eq!(recorder.calls(), failures + 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_handler_ends_terminal() {
    let recorder = Recorder::new(EventType::EnrollmentCreated, usize::MAX);
    let h = Harness::start(&[50], handlers([recorder.clone()]));

    h.academy.enroll("stu-1", "rust-101").await.unwrap();
    h.settle().await;
    assert_eq!(h.snapshot().await, OutboxSnapshot { queued: 0, failed: 1 });
    assert_eq!(recorder.calls(), 2);

    // No automatic retries once terminal.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(recorder.calls(), 2);

    let terminal = h.store.terminal(10).await.unwrap();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, RecordStatus::FailedTerminal);
    assert_eq!(
        terminal[0].last_error.as_deref(),
        Some("recorder: downstream unavailable")
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn same_type_events_arrive_in_enqueue_order() {
    let recorder = Recorder::new(EventType::EnrollmentCancelled, 0);
    let h = Harness::start(&[50], handlers([recorder.clone()]));

    h.academy.cancel("enr-a").await.unwrap();
    h.academy.cancel("enr-b").await.unwrap();
    h.settle().await;

    assert_eq!(recorder.seen(), vec!["enr-a:cancelled", "enr-b:cancelled"]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_enrollment_leaves_no_event() {
    let recorder = Recorder::new(EventType::EnrollmentCreated, 0);
    let h = Harness::start_with_capacity(&[50], handlers([recorder.clone()]), 1);

    h.academy.enroll("stu-1", "rust-101").await.unwrap();
    let err = h.academy.enroll("stu-2", "rust-101").await.unwrap_err();
    assert!(matches!(err, EnrollError::CourseFull(_)));
    h.settle().await;

    assert_eq!(recorder.seen(), vec!["enr-stu-1-rust-101:created"]);
    assert_eq!(h.store.records().await.len(), 1);
    assert_eq!(h.snapshot().await, OutboxSnapshot::default());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn typed_payload_reaches_the_handler() {
    struct Welcome {
        received: Mutex<Vec<EnrollmentCreated>>,
    }

    #[async_trait]
    impl IntegrationEventHandler for Welcome {
        fn event_type(&self) -> EventType {
            EventType::EnrollmentCreated
        }

        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            let payload: EnrollmentCreated = envelope.payload_as()?;
            self.received.lock().unwrap().push(payload);
            Ok(())
        }
    }

    let welcome = Arc::new(Welcome {
        received: Mutex::new(Vec::new()),
    });
    let h = Harness::start(&[50], vec![welcome.clone() as Arc<dyn IntegrationEventHandler>]);

    h.academy.enroll("stu-7", "sql-201").await.unwrap();
    h.settle().await;

    let received = welcome.received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec![EnrollmentCreated {
            enrollment_id: "enr-stu-7-sql-201".to_string(),
            student_id: "stu-7".to_string(),
            course_id: "sql-201".to_string(),
        }]
    );
    h.stop().await;
}
