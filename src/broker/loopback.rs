//! # Loopback Broker
//!
//! An in-memory [`BrokerClient`] implementation that routes producer
//! sends directly to a consumer registered on the same destination name,
//! via a bounded channel. It exists solely so this crate's own tests (and
//! the demo binary) can exercise the full producer/consumer pipeline
//! without a real broker. It is not a broker: no topics fan out to
//! multiple subscribers, no persistence or redelivery semantics apply,
//! and a send to a destination with no registered consumer yet fails
//! immediately instead of queuing.

use super::{
    AckMode, BrokerClient, BrokerConnection, BrokerConsumer, BrokerException, BrokerProducer,
    BrokerResult, BrokerSession, DeliveryMode, Destination,
};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

type Registry = Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>;

/// Shared, clonable loopback broker. Clone to hand the same routing
/// registry to multiple connections.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    registry: Registry,
    temp_counter: Arc<AtomicU64>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerClient for LoopbackBroker {
    async fn create_connection(
        &self,
        _uri: &str,
        _username: &str,
        _password: &str,
        _client_id: &str,
    ) -> BrokerResult<Box<dyn BrokerConnection>> {
        Ok(Box::new(LoopbackConnection {
            registry: self.registry.clone(),
            temp_counter: self.temp_counter.clone(),
        }))
    }
}

struct LoopbackConnection {
    registry: Registry,
    temp_counter: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerConnection for LoopbackConnection {
    async fn start(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    async fn create_session(&self, _ack_mode: AckMode) -> BrokerResult<Box<dyn BrokerSession>> {
        Ok(Box::new(LoopbackSession {
            registry: self.registry.clone(),
            temp_counter: self.temp_counter.clone(),
        }))
    }
}

struct LoopbackSession {
    registry: Registry,
    temp_counter: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerSession for LoopbackSession {
    async fn create_temporary_queue(&self) -> BrokerResult<Destination> {
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Destination::temporary_queue(format!("temp-reply-{n}")))
    }

    async fn create_producer(
        &self,
        destination: Destination,
    ) -> BrokerResult<Box<dyn BrokerProducer>> {
        Ok(Box::new(LoopbackProducer {
            registry: self.registry.clone(),
            destination,
            delivery_mode: DeliveryMode::Persistent,
        }))
    }

    async fn create_consumer(
        &self,
        destination: Destination,
        _selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>> {
        let (tx, rx) = mpsc::channel(1024);
        self.registry.lock().await.insert(destination.name.clone(), tx);
        Ok(Box::new(LoopbackConsumer { receiver: rx }))
    }

    async fn create_durable_consumer(
        &self,
        topic: Destination,
        _client_id: &str,
        selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>> {
        self.create_consumer(topic, selector).await
    }
}

struct LoopbackProducer {
    registry: Registry,
    destination: Destination,
    delivery_mode: DeliveryMode,
}

#[async_trait]
impl BrokerProducer for LoopbackProducer {
    fn set_delivery_mode(&mut self, mode: DeliveryMode) {
        self.delivery_mode = mode;
    }

    async fn send(
        &mut self,
        message: &Message,
        _persistent: bool,
        _priority: i32,
        _ttl_ms: i64,
    ) -> BrokerResult<()> {
        let sender = {
            let registry = self.registry.lock().await;
            registry.get(&self.destination.name).cloned()
        };
        match sender {
            Some(tx) => tx
                .send(message.clone())
                .await
                .map_err(|_| BrokerException("loopback consumer dropped".into())),
            None => Err(BrokerException(format!(
                "no consumer registered for destination {}",
                self.destination.name
            ))),
        }
    }
}

struct LoopbackConsumer {
    receiver: mpsc::Receiver<Message>,
}

#[async_trait]
impl BrokerConsumer for LoopbackConsumer {
    async fn receive(&mut self) -> BrokerResult<Message> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| BrokerException("loopback producer dropped".into()))
    }
}
