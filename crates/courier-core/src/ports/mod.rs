//! Ports: the seams between the dispatcher and the outside world.

pub mod clock;
pub mod outbox_store;

pub use self::clock::{Clock, FixedClock, SystemClock, TokioClock};
pub use self::outbox_store::{OutboxStore, OutboxWriter};
