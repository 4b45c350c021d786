//! # Error Types
//!
//! Central error enumeration for the messaging core. Every error kind named
//! in the design (input, configuration, broker, queue, persistence,
//! invariant) gets its own variant so callers can match on failure class
//! instead of parsing strings.

use thiserror::Error;

/// Errors raised by the messaging core.
///
/// ## Propagation Policy
///
/// - `Input` and `Invariant` are synchronous: returned directly to the
///   caller of the façade method that raised them.
/// - `Broker` is never propagated synchronously from the publish path; the
///   producer engine converts it into an `on_exception` callback instead.
/// - `QueueFull` triggers the recovery-mode transition and an
///   `on_queue_packet_dropped` callback rather than failing the publish.
/// - `Persistence` is synchronous only on the publish path (`deliver`
///   returns it directly) even though it is also logged as a fatal event.
/// - `Config` is swallowed by `init`; the library finishes initialization
///   with whatever topology loaded successfully.
#[derive(Debug, Error)]
pub enum CratewayError {
    /// API called while the library or a component was in the wrong
    /// lifecycle state, or an unknown identifier was referenced.
    #[error("input error: {0}")]
    Input(String),

    /// Configuration file missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// The broker collaborator reported a failure on send, receive, or
    /// connect.
    #[error("broker error: {0}")]
    Broker(String),

    /// The bounded queue rejected an enqueue because it is full.
    #[error("queue full for connection {connection_id}")]
    QueueFull {
        /// Connection whose queue rejected the message.
        connection_id: String,
    },

    /// The persistence log failed to append or update its control file.
    #[error("persistence error on connection {connection_id}: {reason}")]
    Persistence {
        /// Connection whose log failed.
        connection_id: String,
        /// Underlying failure description.
        reason: String,
    },

    /// A counter relation or topology invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Convenience alias used throughout the crate's core modules.
pub type Result<T> = std::result::Result<T, CratewayError>;
