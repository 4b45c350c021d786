//! # Producer Engine
//!
//! Wires together a [`BoundedQueue`], a [`PersistenceLog`], and a broker
//! producer into the publish pipeline: `publish` writes ahead to the log,
//! then enqueues; a sender task drains the queue and hands messages to
//! the broker; a replay task refills the queue from the log while in
//! recovery; and, for request/reply links, a response-consumer task
//! listens on a temporary queue and forwards replies through the
//! callback dispatcher. Grounded on `ActiveProducer.cpp`'s constructor,
//! `send()`/`onReceive()` thread bodies, and `deliver()` contract.

use crate::broker::{BrokerProducer, BrokerSession, DeliveryMode, Destination};
use crate::callback::{CallbackDispatcher, CallbackFrame};
use crate::error::CratewayError;
use crate::message::{Message, ParameterStore, ReplyDestination};
use crate::persistence::PersistenceLog;
use crate::queue::{BoundedQueue, EnqueueOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Recovery state of a single producer, mirroring
/// `ActiveProducer`'s working-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Running,
    InPersistence,
    Closed,
}

/// Static configuration for one producer/link.
pub struct ProducerConfig {
    pub connection_id: String,
    pub link_id: String,
    pub destination: Destination,
    pub queue_capacity: usize,
    pub persistence_size: u64,
    pub request_reply: bool,
    pub persistent: bool,
    pub priority: i32,
    pub time_to_live_ms: i64,
    pub default_properties: ParameterStore,
    /// Directory the persistence log's data/control file pair live in.
    /// `None` uses the process working directory, per the on-disk file
    /// naming convention.
    pub persistence_dir: Option<std::path::PathBuf>,
}

struct Inner {
    connection_id: String,
    link_id: String,
    request_reply: bool,
    persistent: bool,
    priority: i32,
    time_to_live_ms: i64,
    default_properties: ParameterStore,
    reply_to: Option<String>,
    queue: Arc<BoundedQueue>,
    persistence: Arc<PersistenceLog>,
    broker_producer: Mutex<Box<dyn BrokerProducer>>,
    callback: Arc<CallbackDispatcher>,
    state: Mutex<ProducerState>,
    replay_notify: Notify,
    shutdown: Notify,
    closed: AtomicBool,
}

/// Handle to a running producer. Dropping it does not stop the
/// background tasks; call [`ProducerHandle::close`] explicitly.
pub struct ProducerHandle {
    inner: Arc<Inner>,
    sender_task: JoinHandle<()>,
    replay_task: JoinHandle<()>,
    response_task: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Start a producer: runs crash recovery, creates the broker producer
    /// (and, for request/reply links, a temporary reply queue and
    /// consumer), then spawns the sender, replay, and response-consumer
    /// tasks.
    pub async fn start(
        config: ProducerConfig,
        session: &dyn BrokerSession,
        callback: Arc<CallbackDispatcher>,
    ) -> Result<Self, CratewayError> {
        let mut broker_producer = session
            .create_producer(config.destination.clone())
            .await
            .map_err(|e| CratewayError::Broker(e.to_string()))?;
        broker_producer.set_delivery_mode(if config.persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::NonPersistent
        });

        let reply_to = if config.request_reply {
            let temp = session
                .create_temporary_queue()
                .await
                .map_err(|e| CratewayError::Broker(e.to_string()))?;
            Some(temp.name)
        } else {
            None
        };

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let persistence_id = format!("{}_{}", config.connection_id, config.link_id);
        let persistence = Arc::new(match &config.persistence_dir {
            Some(dir) => PersistenceLog::with_base_dir(persistence_id, config.persistence_size, dir),
            None => PersistenceLog::new(persistence_id, config.persistence_size),
        });
        let replay_count = persistence.crash_recovery(config.queue_capacity).await;

        let inner = Arc::new(Inner {
            connection_id: config.connection_id,
            link_id: config.link_id,
            request_reply: config.request_reply,
            persistent: config.persistent,
            priority: config.priority,
            time_to_live_ms: config.time_to_live_ms,
            default_properties: config.default_properties,
            reply_to,
            queue,
            persistence,
            broker_producer: Mutex::new(broker_producer),
            callback,
            state: Mutex::new(if replay_count > 0 {
                ProducerState::InPersistence
            } else {
                ProducerState::Running
            }),
            replay_notify: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let sender_task = tokio::spawn(run_sender(inner.clone()));
        let replay_task = tokio::spawn(run_replay(inner.clone(), replay_count));

        let response_task = if inner.request_reply {
            let response_consumer = session
                .create_consumer(
                    Destination::temporary_queue(inner.reply_to.clone().unwrap_or_default()),
                    None,
                )
                .await
                .map_err(|e| CratewayError::Broker(e.to_string()))?;
            Some(tokio::spawn(run_response_consumer(
                inner.clone(),
                response_consumer,
            )))
        } else {
            None
        };

        Ok(Self {
            inner,
            sender_task,
            replay_task,
            response_task,
        })
    }

    pub async fn state(&self) -> ProducerState {
        *self.inner.state.lock().await
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn link_id(&self) -> &str {
        &self.inner.link_id
    }

    /// Publish a message: stamp routing and reply metadata, write ahead
    /// to the persistence log, then enqueue for the sender task.
    ///
    /// Mirrors `ActiveProducer::deliver(msg, link)`: a failed enqueue is
    /// double-checked against `is_full` before giving up, since the
    /// queue may have drained between the reject and the retry.
    pub async fn publish(&self, mut message: Message) -> Result<(), CratewayError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CratewayError::Invariant("producer is closed".into()));
        }
        message.connection_id = self.inner.connection_id.clone();
        message.link_id = self.inner.link_id.clone();
        for (k, v) in self.inner.default_properties.iter() {
            if message.properties.get(k).is_none() {
                message.properties.insert(k, v.clone());
            }
        }
        if self.inner.request_reply {
            message.request_reply = true;
            if message.correlation_id.is_empty() {
                message.correlation_id = uuid::Uuid::new_v4().to_string();
            }
            message.reply_to = ReplyDestination(self.inner.reply_to.clone());
        }
        message.rebuild_packet_desc();

        self.inner.persistence.serialize(&message).await?;

        if self.inner.persistence.is_recovery_mode().await {
            // Already in recovery: the replay task alone feeds the queue
            // from the log, so the live message just stays logged.
            return Ok(());
        }

        match self.inner.queue.enqueue(message.clone()).await {
            EnqueueOutcome::Accepted(_) => {
                self.inner.persistence.one_more_enqueued().await;
            }
            EnqueueOutcome::Rejected => {
                if self.inner.queue.is_full().await {
                    self.inner.persistence.start_recovery().await;
                    *self.inner.state.lock().await = ProducerState::InPersistence;
                    self.inner.queue.set_working(false);
                    self.inner
                        .callback
                        .dispatch(CallbackFrame::QueuePacketDropped {
                            connection_id: self.inner.connection_id.clone(),
                            link_id: self.inner.link_id.clone(),
                        })
                        .await;
                } else {
                    if let EnqueueOutcome::Accepted(_) = self.inner.queue.enqueue(message).await {
                        self.inner.persistence.one_more_enqueued().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop the background tasks. Idempotent.
    pub async fn close(mut self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state.lock().await = ProducerState::Closed;
        self.inner.shutdown.notify_waiters();
        self.sender_task.abort();
        self.replay_task.abort();
        if let Some(task) = self.response_task.take() {
            task.abort();
        }
    }
}

async fn run_sender(inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.notified() => return,
            msg = inner.queue.dequeue_wait() => msg,
        };

        let dequeued_in_recovery = *inner.state.lock().await == ProducerState::InPersistence;
        let mut producer = inner.broker_producer.lock().await;
        match producer
            .send(
                &message,
                inner.persistent,
                inner.priority,
                inner.time_to_live_ms,
            )
            .await
        {
            Ok(()) => {
                drop(producer);
                if !inner.queue.working() {
                    inner.queue.set_working(true);
                    inner
                        .callback
                        .dispatch(CallbackFrame::QueueReady {
                            connection_id: inner.connection_id.clone(),
                            link_id: inner.link_id.clone(),
                        })
                        .await;
                }
                let outcome = inner.persistence.one_more_sent(dequeued_in_recovery).await;
                if outcome.left_recovery {
                    *inner.state.lock().await = ProducerState::Running;
                }
                if outcome.signal_replay {
                    inner.replay_notify.notify_one();
                }
            }
            Err(e) => {
                drop(producer);
                warn!(connection_id = %inner.connection_id, link_id = %inner.link_id, error = %e, "broker send failed");
                inner
                    .callback
                    .dispatch(CallbackFrame::Exception {
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

/// Refill the queue from the persistence log while in recovery: an
/// initial burst of `initial_count` messages, then one more each time the
/// sender signals it consumed one during recovery.
async fn run_replay(inner: Arc<Inner>, initial_count: u64) {
    for _ in 0..initial_count {
        if !replay_one(&inner).await {
            break;
        }
    }
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => return,
            _ = inner.replay_notify.notified() => {}
        }
        if inner.persistence.is_recovery_mode().await {
            replay_one(&inner).await;
        }
    }
}

async fn replay_one(inner: &Arc<Inner>) -> bool {
    if inner.queue.is_full().await {
        return false;
    }
    match inner.persistence.next_message().await {
        Some(message) => {
            match inner.queue.enqueue(message).await {
                EnqueueOutcome::Accepted(_) => {
                    inner.persistence.one_more_enqueued().await;
                }
                EnqueueOutcome::Rejected => {
                    inner.queue.set_working(false);
                    inner
                        .callback
                        .dispatch(CallbackFrame::QueuePacketDropped {
                            connection_id: inner.connection_id.clone(),
                            link_id: inner.link_id.clone(),
                        })
                        .await;
                }
            }
            true
        }
        None => false,
    }
}

async fn run_response_consumer(
    inner: Arc<Inner>,
    mut consumer: Box<dyn crate::broker::BrokerConsumer>,
) {
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.notified() => return,
            r = consumer.receive() => r,
        };
        match received {
            Ok(message) => {
                debug!(connection_id = %inner.connection_id, link_id = %inner.link_id, "response received");
                inner
                    .callback
                    .dispatch(CallbackFrame::Message {
                        message,
                        link_id: inner.link_id.clone(),
                        service_id: String::new(),
                    })
                    .await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;
    use crate::broker::{AckMode, BrokerClient};
    use crate::callback::ApplicationCallbacks;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::Mutex as TokioMutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct RecordingCallbacks {
        messages: TokioMutex<Vec<String>>,
        dropped: TokioMutex<u32>,
    }

    #[async_trait]
    impl ApplicationCallbacks for RecordingCallbacks {
        async fn on_message(&self, message: Message, _link_id: &str, _service_id: &str) {
            self.messages.lock().await.push(message.text);
        }

        async fn on_queue_packet_dropped(&self, _connection_id: &str, _link_id: &str) {
            *self.dropped.lock().await += 1;
        }
    }

    async fn test_producer(
        dir: &std::path::Path,
        queue_capacity: usize,
    ) -> (ProducerHandle, Arc<RecordingCallbacks>) {
        let broker = LoopbackBroker::new();
        let conn = broker.create_connection("loop://", "", "", "").await.unwrap();
        let session = conn.create_session(AckMode::Auto).await.unwrap();
        let destination = session.create_queue("orders");
        let _consumer = session.create_consumer(destination.clone(), None).await.unwrap();

        let callbacks = Arc::new(RecordingCallbacks::default());
        let dispatcher = Arc::new(CallbackDispatcher::new(16, true, callbacks.clone()));

        let config = ProducerConfig {
            connection_id: "c1".into(),
            link_id: "l1".into(),
            destination,
            queue_capacity,
            persistence_size: 0,
            request_reply: false,
            persistent: true,
            priority: 0,
            time_to_live_ms: 0,
            default_properties: ParameterStore::new(),
            persistence_dir: Some(dir.to_path_buf()),
        };
        let producer = ProducerHandle::start(config, session.as_ref(), dispatcher)
            .await
            .unwrap();
        (producer, callbacks)
    }

    #[tokio::test]
    async fn publish_is_delivered_to_consumer_via_callback() {
        let dir = tempdir().unwrap();
        let (producer, callbacks) = test_producer(dir.path(), 10).await;
        producer
            .publish(Message::text("orders", "order-1"))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(producer.state().await, ProducerState::Running);
        drop(callbacks);
        producer.close().await;
    }

    #[tokio::test]
    async fn close_stops_background_tasks_without_panicking() {
        let dir = tempdir().unwrap();
        let (producer, _callbacks) = test_producer(dir.path(), 10).await;
        producer.close().await;
    }
}
