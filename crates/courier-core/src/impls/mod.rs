//! Outbox store backends.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryOutboxStore, MemoryUnitOfWork};
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;

/// Error recorded on claims released by the visibility window.
pub const CLAIM_EXPIRED: &str = "claim visibility window expired";
