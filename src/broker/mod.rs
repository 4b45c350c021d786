//! # Broker Collaborator Traits
//!
//! The wire protocol of the underlying JMS-style message broker is
//! explicitly out of scope for this crate (see spec.md §1/§6.2) — no real
//! broker client ships here. What this module provides instead is the
//! trait boundary the producer and consumer engines are written against,
//! so the core can be exercised and tested without depending on any
//! concrete broker implementation. This mirrors the way the teacher
//! benchmark suite defines `IpcTransport` as the seam between benchmark
//! logic and the four concrete transports it ships.
//!
//! A single in-memory implementation, [`loopback::LoopbackBroker`], is
//! provided purely as a test/demo fixture — it is not a broker and should
//! never be mistaken for one.

pub mod loopback;

use crate::message::Message;
use async_trait::async_trait;
use std::fmt;

/// Delivery mode reported to the broker producer. Internally `0` means
/// persistent; `get_persistent()` on the public API negates this (see
/// spec.md §4.3's priority/TTL/persistence tie-breaks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Persistent,
    NonPersistent,
}

/// Session acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
}

/// Errors surfaced by a broker collaborator. Always converted into an
/// `on_exception` callback by the producer/consumer engines — never
/// propagated synchronously to the publishing caller.
#[derive(Debug, Clone)]
pub struct BrokerException(pub String);

impl fmt::Display for BrokerException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BrokerException {}

pub type BrokerResult<T> = std::result::Result<T, BrokerException>;

/// A broker-side destination (topic, queue, or temporary queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub is_topic: bool,
    pub is_temporary: bool,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_topic: true,
            is_temporary: false,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_topic: false,
            is_temporary: false,
        }
    }

    pub fn temporary_queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_topic: false,
            is_temporary: true,
        }
    }
}

/// A connection to the broker. Created via [`BrokerClient::create_connection`].
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn start(&mut self) -> BrokerResult<()>;
    async fn close(&mut self) -> BrokerResult<()>;
    async fn create_session(&self, ack_mode: AckMode) -> BrokerResult<Box<dyn BrokerSession>>;
}

/// A session within a connection, used to create destinations, producers,
/// and consumers.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn create_topic(&self, name: &str) -> Destination {
        Destination::topic(name)
    }

    fn create_queue(&self, name: &str) -> Destination {
        Destination::queue(name)
    }

    async fn create_temporary_queue(&self) -> BrokerResult<Destination>;

    async fn create_producer(
        &self,
        destination: Destination,
    ) -> BrokerResult<Box<dyn BrokerProducer>>;

    async fn create_consumer(
        &self,
        destination: Destination,
        selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>>;

    async fn create_durable_consumer(
        &self,
        topic: Destination,
        client_id: &str,
        selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>>;
}

/// A producer bound to a single destination.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    fn set_delivery_mode(&mut self, mode: DeliveryMode);

    /// Send one wire-encoded message, with the priority and TTL that
    /// apply to this particular send (spec.md §4.3 step: "calls the
    /// broker client's send with persistent/priority/TTL").
    async fn send(
        &mut self,
        message: &Message,
        persistent: bool,
        priority: i32,
        ttl_ms: i64,
    ) -> BrokerResult<()>;
}

/// A consumer bound to a single destination.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Block until a message arrives.
    async fn receive(&mut self) -> BrokerResult<Message>;

    /// Acknowledge the most recently received message. Only meaningful for
    /// a session created with [`AckMode::Client`]; a no-op default covers
    /// implementations that only ever run auto-ack.
    async fn acknowledge(&mut self) -> BrokerResult<()> {
        Ok(())
    }
}

/// Top-level client factory, analogous to a JMS `ConnectionFactory`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_connection(
        &self,
        uri: &str,
        username: &str,
        password: &str,
        client_id: &str,
    ) -> BrokerResult<Box<dyn BrokerConnection>>;
}
