//! Application layer: configuration, wiring and the dispatch loop.

pub mod builder;
pub mod config;
pub mod dispatcher;

pub use self::builder::DispatcherBuilder;
pub use self::config::DispatcherConfig;
pub use self::dispatcher::{Dispatcher, DispatcherHandle, TickPhase, TickReport};
