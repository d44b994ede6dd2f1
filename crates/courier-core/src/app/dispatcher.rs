//! Dispatcher: the polling loop that delivers outbox records to handlers.
//!
//! # Tick
//! 1. Skip if the previous tick of this dispatcher is still running.
//! 2. Release claims older than the claim timeout.
//! 3. Claim up to `batch_size` due records (id ascending).
//! 4. For each record, run every handler of its type in registration order.
//!    All succeed -> `ack`; any fails -> `fail` (retry or terminal).
//!
//! A handler failure or panic only affects its own record. A store error
//! before the claim aborts the tick. Once a batch is claimed every record in
//! it is invoked; a record whose ack or fail could not be written stays
//! claimed and comes back through the claim visibility window.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::app::config::DispatcherConfig;
use crate::domain::{
    DispatchError, Envelope, FailOutcome, HandlerError, OutboxRecord, OutboxSnapshot, StoreError,
};
use crate::ports::{Clock, OutboxStore};
use crate::registry::{HandlerRegistry, IntegrationEventHandler};

/// Where the dispatcher is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TickPhase {
    Idle = 0,
    Polling = 1,
    Claiming = 2,
    Invoking = 3,
    Updating = 4,
}

impl TickPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TickPhase::Polling,
            2 => TickPhase::Claiming,
            3 => TickPhase::Invoking,
            4 => TickPhase::Updating,
            _ => TickPhase::Idle,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub dispatched: usize,
    /// Failed and scheduled for another attempt.
    pub retried: usize,
    /// Failed with the backoff series exhausted.
    pub terminal: usize,
    /// Invoked, but the ack or fail could not be written. These stay claimed
    /// until the claim visibility window releases them.
    pub unsettled: usize,
    /// Expired claims returned to the queue.
    pub released: u64,
    /// The previous tick was still running, nothing was done.
    pub skipped: bool,
}

pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    tick_lock: Mutex<()>,
    phase: AtomicU8,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn OutboxStore>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            clock,
            config,
            tick_lock: Mutex::new(()),
            phase: AtomicU8::new(TickPhase::Idle as u8),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn phase(&self) -> TickPhase {
        TickPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Store counters, for health checks.
    pub async fn snapshot(&self) -> Result<OutboxSnapshot, StoreError> {
        self.store.snapshot().await
    }

    /// Run one tick.
    pub async fn tick(&self) -> Result<TickReport, DispatchError> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("previous tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };

        let result = self.run_tick().await;
        self.set_phase(TickPhase::Idle);
        result
    }

    async fn run_tick(&self) -> Result<TickReport, DispatchError> {
        let mut report = TickReport::default();

        self.set_phase(TickPhase::Polling);
        let now = self.clock.now();
        report.released = self
            .store
            .release_expired(self.claim_cutoff(now), now)
            .await
            .map_err(|e| DispatchError::store("release_expired", e))?;

        self.set_phase(TickPhase::Claiming);
        let records = self
            .store
            .claim_due(self.config.batch_size, now)
            .await
            .map_err(|e| DispatchError::store("claim_due", e))?;
        report.claimed = records.len();

        for record in &records {
            self.set_phase(TickPhase::Invoking);
            let outcome = self.invoke(record).await;

            self.set_phase(TickPhase::Updating);
            match outcome {
                Ok(()) => self.acknowledge(record, &mut report).await,
                Err(reason) => self.reschedule(record, &reason, &mut report).await,
            }
        }

        if report.claimed > 0 || report.released > 0 {
            debug!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                retried = report.retried,
                terminal = report.terminal,
                unsettled = report.unsettled,
                released = report.released,
                "outbox tick finished"
            );
        }
        Ok(report)
    }

    /// Run every handler of the record's type, stopping at the first failure.
    async fn invoke(&self, record: &OutboxRecord) -> Result<(), String> {
        let envelope = &record.envelope;
        for handler in self.registry.handlers_for(envelope.event_type()) {
            if let Err(err) = self.call(handler.as_ref(), envelope).await {
                return Err(format!("{}: {err}", handler.name()));
            }
        }
        Ok(())
    }

    /// One handler call; a timeout or a panic comes back as a `HandlerError`.
    async fn call(
        &self,
        handler: &dyn IntegrationEventHandler,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let guarded = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();
        let outcome = match self.config.handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerError::TimedOut(limit)),
            },
            None => guarded.await,
        };
        outcome.unwrap_or_else(|payload| {
            Err(HandlerError::Panicked(panic_message(payload.as_ref())))
        })
    }

    async fn acknowledge(&self, record: &OutboxRecord, report: &mut TickReport) {
        match self.store.ack(record.id, self.clock.now()).await {
            Ok(()) => {
                report.dispatched += 1;
                debug!(
                    outbox_id = %record.id,
                    event_type = %record.envelope.event_type(),
                    dedup_key = %record.envelope.dedup_key(),
                    attempts = record.attempts,
                    "outbox record dispatched"
                );
            }
            Err(e) => Self::unsettled("ack", record, &e, report),
        }
    }

    async fn reschedule(&self, record: &OutboxRecord, reason: &str, report: &mut TickReport) {
        match self.store.fail(record.id, reason, self.clock.now()).await {
            Ok(FailOutcome::Retry { next_attempt_at }) => {
                report.retried += 1;
                warn!(
                    outbox_id = %record.id,
                    event_type = %record.envelope.event_type(),
                    dedup_key = %record.envelope.dedup_key(),
                    attempts = record.attempts,
                    error = reason,
                    %next_attempt_at,
                    "outbox handler failed, retry scheduled"
                );
            }
            Ok(FailOutcome::Terminal) => {
                report.terminal += 1;
                error!(
                    outbox_id = %record.id,
                    event_type = %record.envelope.event_type(),
                    dedup_key = %record.envelope.dedup_key(),
                    attempts = record.attempts,
                    error = reason,
                    "outbox record failed terminally"
                );
            }
            Err(e) => Self::unsettled("fail", record, &e, report),
        }
    }

    /// The outcome of an invoked record could not be written. It stays
    /// claimed; the rest of the batch goes on.
    fn unsettled(
        operation: &'static str,
        record: &OutboxRecord,
        err: &StoreError,
        report: &mut TickReport,
    ) {
        report.unsettled += 1;
        if err.is_transient() {
            warn!(
                outbox_id = %record.id,
                event_type = %record.envelope.event_type(),
                error = %err,
                operation,
                "outbox store unavailable, record left to the claim window"
            );
        } else {
            error!(
                outbox_id = %record.id,
                event_type = %record.envelope.event_type(),
                error = %err,
                operation,
                "outbox store rejected update"
            );
        }
    }

    fn claim_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.config.claim_timeout())
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn set_phase(&self, phase: TickPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Run ticks every `dispatch_interval` on a background task.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(self, shutdown_rx));
        DispatcherHandle { shutdown_tx, join }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_loop(dispatcher: Arc<Dispatcher>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(dispatcher.config.dispatch_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_ms = dispatcher.config.dispatch_interval_ms,
        batch_size = dispatcher.config.batch_size,
        handlers = dispatcher.registry.len(),
        "outbox dispatcher started"
    );

    loop {
        tokio::select! {
            biased;
            // Also fires when the handle is dropped.
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        // Not raced against shutdown: an in-flight tick always completes.
        if let Err(err) = dispatcher.tick().await {
            warn!(error = %err, "outbox tick aborted, retrying on the next tick");
        }
    }

    info!("outbox dispatcher stopped");
}

/// Handle to a spawned dispatcher loop.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop scheduling new ticks. Does not wait.
    pub fn request_shutdown(&self) {
        // receiver already gone means the loop already exited
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the in-flight tick, if any, to finish.
    pub async fn shutdown(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox dispatcher task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
