//! # Consumer Engine
//!
//! A consumer engine binds a broker consumer to one destination and
//! forwards every received message to the application through the
//! callback dispatcher, exactly one receive loop per consumer. Grounded
//! on `ActiveManager::onMessageCallback`'s fan-in from the link layer to
//! the application callback, and on `ActiveManager::sendResponse` for
//! replying to a request/reply message via its captured reply
//! destination.
//!
//! Decoding broker wire formats (stream vs. text messages, JMS property
//! type probing) is a concern of a concrete [`crate::broker`]
//! implementation, not of this engine — this crate's `BrokerConsumer`
//! already hands back a fully-typed [`Message`].

use crate::broker::{AckMode, BrokerConsumer, BrokerSession, Destination};
use crate::callback::{CallbackDispatcher, CallbackFrame};
use crate::error::CratewayError;
use crate::message::Message;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct ConsumerConfig {
    pub connection_id: String,
    pub link_id: String,
    pub service_id: String,
    pub destination: Destination,
    pub durable: bool,
    pub client_id: String,
    pub selector: Option<String>,
    pub ack_mode: AckMode,
}

struct Inner {
    connection_id: String,
    link_id: String,
    service_id: String,
    session: Arc<dyn BrokerSession>,
    callback: Arc<CallbackDispatcher>,
    shutdown: Notify,
    ack_mode: AckMode,
}

/// Handle to a running consumer engine.
pub struct ConsumerHandle {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub async fn start(
        config: ConsumerConfig,
        session: Arc<dyn BrokerSession>,
        callback: Arc<CallbackDispatcher>,
    ) -> Result<Self, CratewayError> {
        let consumer = if config.durable {
            session
                .create_durable_consumer(
                    config.destination.clone(),
                    &config.client_id,
                    config.selector.as_deref(),
                )
                .await
        } else {
            session
                .create_consumer(config.destination.clone(), config.selector.as_deref())
                .await
        }
        .map_err(|e| CratewayError::Broker(e.to_string()))?;

        let inner = Arc::new(Inner {
            connection_id: config.connection_id,
            link_id: config.link_id,
            service_id: config.service_id,
            session,
            callback,
            shutdown: Notify::new(),
            ack_mode: config.ack_mode,
        });
        let task = tokio::spawn(run(inner.clone(), consumer));
        Ok(Self { inner, task })
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn link_id(&self) -> &str {
        &self.inner.link_id
    }

    /// Reply to a received request/reply message via its captured reply
    /// destination. Fails if the original message carried none.
    pub async fn send_response(
        &self,
        original: &Message,
        mut response: Message,
    ) -> Result<(), CratewayError> {
        let reply_name = original
            .reply_to
            .0
            .clone()
            .ok_or_else(|| CratewayError::Invariant("message has no reply destination".into()))?;
        response.correlation_id = original.correlation_id.clone();
        response.connection_id = self.inner.connection_id.clone();
        response.link_id = self.inner.link_id.clone();
        response.rebuild_packet_desc();

        let mut producer = self
            .inner
            .session
            .create_producer(Destination::temporary_queue(reply_name))
            .await
            .map_err(|e| CratewayError::Broker(e.to_string()))?;
        producer
            .send(&response, true, 0, 0)
            .await
            .map_err(|e| CratewayError::Broker(e.to_string()))
    }

    pub async fn close(self) {
        self.inner.shutdown.notify_waiters();
        self.task.abort();
    }
}

async fn run(inner: Arc<Inner>, mut consumer: Box<dyn BrokerConsumer>) {
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.notified() => return,
            r = consumer.receive() => r,
        };
        match received {
            Ok(message) => {
                debug!(
                    connection_id = %inner.connection_id,
                    link_id = %inner.link_id,
                    "message received"
                );
                inner
                    .callback
                    .dispatch(CallbackFrame::Message {
                        message,
                        link_id: inner.link_id.clone(),
                        service_id: inner.service_id.clone(),
                    })
                    .await;
                if inner.ack_mode == AckMode::Client {
                    if let Err(e) = consumer.acknowledge().await {
                        inner
                            .callback
                            .dispatch(CallbackFrame::Exception { error: e.to_string() })
                            .await;
                    }
                }
            }
            Err(e) => {
                inner
                    .callback
                    .dispatch(CallbackFrame::Exception {
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}
