//! Connection lifecycle supervision
//!
//! A [`SupervisorHandle`] drives one logical client of a connection. Behind it
//! run the supervisor (lifecycle state machine), a connection-handling worker
//! for all broker I/O, one consumer actor per source address and consumer
//! index, and one publisher with its producer cache.

pub mod consumer;
pub mod fsm;
pub mod messages;
pub mod publisher;
pub mod resolver;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use messages::{CommandOutcome, CommandResult, LifecycleCommand};
pub use publisher::QUEUE_FULL_REASON;
pub use resolver::{DefaultStatusResolver, StatusResolver};
pub use supervisor::{SupervisorBuilder, SupervisorHandle, SupervisorSettings};
