//! Domain model (envelopes, outbox records, errors).

pub mod envelope;
pub mod errors;
pub mod record;

pub use envelope::{DedupKey, Envelope, EventType, UnknownEventType};
pub use errors::{BuildError, ConfigError, DispatchError, HandlerError, StoreError};
pub use record::{FailOutcome, OutboxId, OutboxRecord, OutboxSnapshot, RecordStatus};
