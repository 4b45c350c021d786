//! Publishing faster than a slow broker can drain fills the bounded
//! queue, which should trip recovery mode (an `on_queue_packet_dropped`
//! callback) and later clear it again (`on_queue_ready`) once the
//! backlog drains, without the producer ever panicking or wedging.

use async_trait::async_trait;
use crateway::broker::{
    AckMode, BrokerClient, BrokerConnection, BrokerConsumer, BrokerException, BrokerProducer,
    BrokerResult, BrokerSession, DeliveryMode, Destination,
};
use crateway::callback::ApplicationCallbacks;
use crateway::config::ProducerLinkConfig;
use crateway::facade::Facade;
use crateway::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// A broker double whose producer send is artificially slow, so a burst
/// of publishes can outrun the drain rate and fill the queue.
struct SlowBroker {
    delay: Duration,
    sent_count: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerClient for SlowBroker {
    async fn create_connection(
        &self,
        _uri: &str,
        _username: &str,
        _password: &str,
        _client_id: &str,
    ) -> BrokerResult<Box<dyn BrokerConnection>> {
        Ok(Box::new(SlowConnection {
            delay: self.delay,
            sent_count: self.sent_count.clone(),
        }))
    }
}

struct SlowConnection {
    delay: Duration,
    sent_count: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerConnection for SlowConnection {
    async fn start(&mut self) -> BrokerResult<()> {
        Ok(())
    }
    async fn close(&mut self) -> BrokerResult<()> {
        Ok(())
    }
    async fn create_session(&self, _ack_mode: AckMode) -> BrokerResult<Box<dyn BrokerSession>> {
        Ok(Box::new(SlowSession {
            delay: self.delay,
            sent_count: self.sent_count.clone(),
        }))
    }
}

struct SlowSession {
    delay: Duration,
    sent_count: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerSession for SlowSession {
    async fn create_temporary_queue(&self) -> BrokerResult<Destination> {
        Err(BrokerException("not needed in this test".into()))
    }

    async fn create_producer(
        &self,
        _destination: Destination,
    ) -> BrokerResult<Box<dyn BrokerProducer>> {
        Ok(Box::new(SlowProducer {
            delay: self.delay,
            sent_count: self.sent_count.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        _destination: Destination,
        _selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>> {
        Err(BrokerException("not needed in this test".into()))
    }

    async fn create_durable_consumer(
        &self,
        _topic: Destination,
        _client_id: &str,
        _selector: Option<&str>,
    ) -> BrokerResult<Box<dyn BrokerConsumer>> {
        Err(BrokerException("not needed in this test".into()))
    }
}

struct SlowProducer {
    delay: Duration,
    sent_count: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerProducer for SlowProducer {
    fn set_delivery_mode(&mut self, _mode: DeliveryMode) {}

    async fn send(
        &mut self,
        _message: &Message,
        _persistent: bool,
        _priority: i32,
        _ttl_ms: i64,
    ) -> BrokerResult<()> {
        sleep(self.delay).await;
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingCallbacks {
    dropped: AtomicUsize,
    queue_ready: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl ApplicationCallbacks for RecordingCallbacks {
    async fn on_message(&self, message: Message, _link_id: &str, _service_id: &str) {
        self.messages.lock().await.push(message.text);
    }

    async fn on_queue_packet_dropped(&self, _connection_id: &str, _link_id: &str) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_queue_ready(&self, _connection_id: &str, _link_id: &str) {
        self.queue_ready.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn queue_full_trips_recovery_and_later_clears() {
    let sent_count = Arc::new(AtomicUsize::new(0));
    let broker = SlowBroker {
        delay: Duration::from_millis(80),
        sent_count: sent_count.clone(),
    };
    let callbacks = Arc::new(RecordingCallbacks::default());
    let facade = Arc::new(Facade::new(Arc::new(broker), callbacks.clone(), 64, true));
    facade.initialize().await.unwrap();
    facade
        .add_connection("recovery-conn", "loop://", "", "", "")
        .await
        .unwrap();
    facade
        .add_producer(ProducerLinkConfig {
            link_id: "recovery-p1".into(),
            connection_id: "recovery-conn".into(),
            destination: "recovery-dest".into(),
            is_topic: false,
            service_id: Some("slow-orders".into()),
            queue_capacity: 2,
            persistence_size: 0,
            request_reply: false,
            persistent: true,
            priority: 0,
            time_to_live_ms: 0,
            default_properties: HashMap::new(),
            cert_path: None,
        })
        .await
        .unwrap();

    // Fire a burst of publishes without waiting between them, so they
    // outrun the 80ms-per-message drain rate and overflow the
    // capacity-2 queue.
    let mut handles = Vec::new();
    for i in 0..20 {
        let facade = facade.clone();
        handles.push(tokio::spawn(async move {
            let _ = facade
                .publish("slow-orders", Message::text("slow-orders", format!("m{i}")))
                .await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    assert!(
        callbacks.dropped.load(Ordering::SeqCst) > 0,
        "expected at least one queue-full drop under a bursty publish load"
    );

    // Give the slow broker time to drain whatever made it into the queue.
    sleep(Duration::from_millis(2500)).await;
    assert!(
        callbacks.queue_ready.load(Ordering::SeqCst) > 0,
        "expected the queue to report ready again once it drained"
    );
    assert!(sent_count.load(Ordering::SeqCst) > 0);

    facade.close().await.unwrap();
}
