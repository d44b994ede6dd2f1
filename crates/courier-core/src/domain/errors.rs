//! Error types and their classification.

use std::time::Duration;

use thiserror::Error;

use super::envelope::{DedupKey, EventType};
use super::record::{OutboxId, RecordStatus};

/// Errors raised by an outbox store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outbox record {0} not found")]
    NotFound(OutboxId),

    #[error("outbox record {id} is {actual}, cannot move it to {target}")]
    InvalidTransition {
        id: OutboxId,
        actual: RecordStatus,
        target: RecordStatus,
    },

    #[error("an envelope with dedup key {0} is already in the outbox")]
    DuplicateDedupKey(DedupKey),

    #[error("outbox record {id} is corrupt: {reason}")]
    Corrupt { id: OutboxId, reason: String },

    #[error("outbox storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Transient errors before a batch is claimed abort the tick; the next
    /// tick retries. After the claim, every error only concerns its record.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            #[cfg(any(feature = "sqlite", feature = "postgres"))]
            StoreError::Database(_) => true,
            _ => false,
        }
    }
}

/// Failure reported by an integration event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Why a tick stopped early.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl DispatchError {
    pub(crate) fn store(operation: &'static str, source: StoreError) -> Self {
        DispatchError::Store { operation, source }
    }
}

/// Rejected dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("dispatch_interval_ms must be greater than zero")]
    ZeroInterval,

    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,

    #[error("claim_timeout_ms must be greater than zero")]
    ZeroClaimTimeout,

    #[error("handler_timeout_ms ({handler_ms}) must be shorter than claim_timeout_ms ({claim_ms})")]
    HandlerTimeoutTooLong { handler_ms: u64, claim_ms: u64 },

    #[error("backoff_series_ms {config:?} does not match the store's series {store:?}")]
    BackoffMismatch { config: Vec<u64>, store: Vec<u64> },
}

/// Errors from assembling a dispatcher.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no handler registered for expected event types: {0:?}")]
    MissingHandlers(Vec<EventType>),

    #[error("invalid dispatcher config: {0}")]
    Config(#[from] ConfigError),
}
