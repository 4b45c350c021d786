//! # Crateway
//!
//! An async JMS-style messaging façade: typed messages with ordered
//! parameters/properties, a broker collaborator trait boundary, a
//! crash-safe write-ahead persistence log, bounded producer queues with
//! graded back-pressure, a serializing callback dispatcher, and a
//! connection/link/service topology index — all wired together behind a
//! single lifecycle-gated [`facade::Facade`].
//!
//! The wire protocol of any concrete broker is out of scope here; this
//! crate ships only the collaborator traits plus an in-memory
//! [`broker::loopback::LoopbackBroker`] fixture for tests and the demo
//! binary.

pub mod broker;
pub mod callback;
pub mod config;
pub mod consumer;
pub mod error;
pub mod facade;
pub mod logging;
pub mod message;
pub mod persistence;
pub mod producer;
pub mod queue;
pub mod topology;

pub use error::{CratewayError, Result};
pub use facade::Facade;
pub use message::Message;

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Default bounded queue capacity for a producer link.
    pub const QUEUE_CAPACITY: usize = 1000;

    /// Default callback dispatcher queue capacity.
    pub const CALLBACK_QUEUE_CAPACITY: usize = 256;

    /// Persistence size of `0` disables the write-ahead log entirely.
    pub const PERSISTENCE_DISABLED: u64 = 0;
}
