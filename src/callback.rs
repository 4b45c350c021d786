//! # Callback Dispatcher
//!
//! Every inbound event the engine raises towards the application —
//! delivered messages, broker exceptions, connection interruption and
//! restoration, and queue back-pressure notifications — is funneled
//! through a single bounded queue and drained by one worker task, so the
//! application never sees two callbacks run concurrently by default.
//! Grounded on the callback-dispatch pattern in `ActiveProducer.cpp`
//! (`onException`/`transportInterrupted`/`transportResumed`, all routed
//! through `activeCallbackThread`) and `ActiveManager.cpp`'s
//! `onMessageCallback`/`onQueuePacketDropped`/`onQueuePacketReady`.
//!
//! `serialize_consumption` narrows that guarantee for `on_message` only:
//! when disabled, message delivery is handed to its own task so a slow
//! application handler can't stall exception/interruption callbacks
//! behind it, at the cost of losing in-order, non-overlapping delivery.

use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One unit of work destined for the application's callback implementation.
#[derive(Debug)]
pub enum CallbackFrame {
    Message {
        message: Message,
        link_id: String,
        service_id: String,
    },
    Exception {
        error: String,
    },
    ConnectionInterrupted {
        connection_id: String,
    },
    ConnectionRestored {
        connection_id: String,
    },
    QueuePacketDropped {
        connection_id: String,
        link_id: String,
    },
    QueueReady {
        connection_id: String,
        link_id: String,
    },
}

/// Application hooks. All methods default to a no-op so implementers only
/// override the events they care about.
#[async_trait]
pub trait ApplicationCallbacks: Send + Sync {
    async fn on_message(&self, _message: Message, _link_id: &str, _service_id: &str) {}
    async fn on_exception(&self, _error: &str) {}
    async fn on_connection_interrupted(&self, _connection_id: &str) {}
    async fn on_connection_restored(&self, _connection_id: &str) {}
    async fn on_queue_packet_dropped(&self, _connection_id: &str, _link_id: &str) {}
    async fn on_queue_ready(&self, _connection_id: &str, _link_id: &str) {}
}

/// Bounded queue plus the single worker task draining it.
pub struct CallbackDispatcher {
    sender: mpsc::Sender<CallbackFrame>,
}

impl CallbackDispatcher {
    pub fn new(
        capacity: usize,
        serialize_consumption: bool,
        callbacks: Arc<dyn ApplicationCallbacks>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(Self::run(receiver, serialize_consumption, callbacks));
        Self { sender }
    }

    /// Enqueue a frame for the worker task. Blocks (applying back-pressure
    /// to the caller) if the queue is momentarily full.
    pub async fn dispatch(&self, frame: CallbackFrame) {
        if self.sender.send(frame).await.is_err() {
            warn!("callback worker gone, dropping frame");
        }
    }

    async fn run(
        mut receiver: mpsc::Receiver<CallbackFrame>,
        serialize_consumption: bool,
        callbacks: Arc<dyn ApplicationCallbacks>,
    ) {
        while let Some(frame) = receiver.recv().await {
            match frame {
                CallbackFrame::Message {
                    message,
                    link_id,
                    service_id,
                } => {
                    if serialize_consumption {
                        callbacks.on_message(message, &link_id, &service_id).await;
                    } else {
                        let callbacks = callbacks.clone();
                        tokio::spawn(async move {
                            callbacks.on_message(message, &link_id, &service_id).await;
                        });
                    }
                }
                CallbackFrame::Exception { error } => callbacks.on_exception(&error).await,
                CallbackFrame::ConnectionInterrupted { connection_id } => {
                    callbacks.on_connection_interrupted(&connection_id).await
                }
                CallbackFrame::ConnectionRestored { connection_id } => {
                    callbacks.on_connection_restored(&connection_id).await
                }
                CallbackFrame::QueuePacketDropped {
                    connection_id,
                    link_id,
                } => {
                    callbacks
                        .on_queue_packet_dropped(&connection_id, &link_id)
                        .await
                }
                CallbackFrame::QueueReady {
                    connection_id,
                    link_id,
                } => callbacks.on_queue_ready(&connection_id, &link_id).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct RecordingCallbacks {
        messages: Mutex<Vec<String>>,
        exceptions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ApplicationCallbacks for RecordingCallbacks {
        async fn on_message(&self, message: Message, _link_id: &str, _service_id: &str) {
            self.messages.lock().await.push(message.text);
        }

        async fn on_exception(&self, error: &str) {
            self.exceptions.lock().await.push(error.to_string());
        }
    }

    #[tokio::test]
    async fn delivers_message_and_exception_frames_in_order() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let dispatcher = CallbackDispatcher::new(8, true, callbacks.clone());

        dispatcher
            .dispatch(CallbackFrame::Message {
                message: Message::text("svc", "hello"),
                link_id: "l1".into(),
                service_id: "svc".into(),
            })
            .await;
        dispatcher
            .dispatch(CallbackFrame::Exception {
                error: "boom".into(),
            })
            .await;

        sleep(Duration::from_millis(20)).await;
        assert_eq!(*callbacks.messages.lock().await, vec!["hello".to_string()]);
        assert_eq!(*callbacks.exceptions.lock().await, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn unserialized_consumption_does_not_block_other_frames() {
        struct SlowThenRecord {
            exception_seen: Mutex<bool>,
        }

        #[async_trait]
        impl ApplicationCallbacks for SlowThenRecord {
            async fn on_message(&self, _message: Message, _link_id: &str, _service_id: &str) {
                sleep(Duration::from_millis(100)).await;
            }

            async fn on_exception(&self, _error: &str) {
                *self.exception_seen.lock().await = true;
            }
        }

        let callbacks = Arc::new(SlowThenRecord {
            exception_seen: Mutex::new(false),
        });
        let dispatcher = CallbackDispatcher::new(8, false, callbacks.clone());
        dispatcher
            .dispatch(CallbackFrame::Message {
                message: Message::text("svc", "slow"),
                link_id: "l1".into(),
                service_id: "svc".into(),
            })
            .await;
        dispatcher
            .dispatch(CallbackFrame::Exception {
                error: "fast".into(),
            })
            .await;

        sleep(Duration::from_millis(20)).await;
        assert!(*callbacks.exception_seen.lock().await);
    }
}
