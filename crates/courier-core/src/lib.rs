//! courier-core
//!
//! Transactional outbox with an at-least-once dispatcher.
//!
//! Producers enqueue an [`Envelope`] inside the same unit of work as their
//! business write; the [`Dispatcher`] polls the store, hands due records to
//! the [`IntegrationEventHandler`]s registered for their type, and acks them
//! or schedules a retry following the [`BackoffPolicy`].
//!
//! # Modules
//! - **domain**: envelopes, outbox records, errors
//! - **ports**: `OutboxWriter`, `OutboxStore`, `Clock`
//! - **backoff**: retry delays and exhaustion
//! - **registry**: handlers grouped by event type
//! - **impls**: in-memory, SQLite (`sqlite` feature) and PostgreSQL
//!   (`postgres` feature) stores
//! - **app**: config, builder, dispatcher

pub mod app;
pub mod backoff;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod registry;

pub use app::{Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherHandle, TickPhase, TickReport};
pub use backoff::{BackoffPolicy, RetryDecision};
pub use domain::{
    BuildError, ConfigError, DedupKey, DispatchError, Envelope, EventType, FailOutcome,
    HandlerError, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus, StoreError,
};
pub use impls::{InMemoryOutboxStore, MemoryUnitOfWork};
pub use ports::{Clock, FixedClock, OutboxStore, OutboxWriter, SystemClock, TokioClock};
pub use registry::{HandlerRegistry, IntegrationEventHandler};
