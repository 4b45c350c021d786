//! Messages written ahead to the persistence log but never acknowledged
//! as sent survive a producer "crash": starting a fresh producer against
//! the same connection/link id and persistence directory detects the
//! backlog and replays it once a working broker is available.

use async_trait::async_trait;
use crateway::broker::loopback::LoopbackBroker;
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

/// A broker double whose producer send always fails, standing in for a
/// broker connection that's down when the process "crashes".
#[derive(Clone)]
struct DownBroker;

#[async_trait]
impl BrokerClient for DownBroker {
    async fn create_connection(
        &self,
        _uri: &str,
        _username: &str,
        _password: &str,
        _client_id: &str,
    ) -> BrokerResult<Box<dyn BrokerConnection>> {
        Ok(Box::new(DownConnection))
    }
}

struct DownConnection;

#[async_trait]
impl BrokerConnection for DownConnection {
    async fn start(&mut self) -> BrokerResult<()> {
        Ok(())
    }
    async fn close(&mut self) -> BrokerResult<()> {
        Ok(())
    }
    async fn create_session(&self, _ack_mode: AckMode) -> BrokerResult<Box<dyn BrokerSession>> {
        Ok(Box::new(DownSession))
    }
}

struct DownSession;

#[async_trait]
impl BrokerSession for DownSession {
    async fn create_temporary_queue(&self) -> BrokerResult<Destination> {
        Err(BrokerException("not needed in this test".into()))
    }

    async fn create_producer(
        &self,
        _destination: Destination,
    ) -> BrokerResult<Box<dyn BrokerProducer>> {
        Ok(Box::new(DownProducer))
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

struct DownProducer;

#[async_trait]
impl BrokerProducer for DownProducer {
    fn set_delivery_mode(&mut self, _mode: DeliveryMode) {}

    async fn send(
        &mut self,
        _message: &Message,
        _persistent: bool,
        _priority: i32,
        _ttl_ms: i64,
    ) -> BrokerResult<()> {
        Err(BrokerException("broker unreachable".into()))
    }
}

#[derive(Default)]
struct RecordingCallbacks {
    messages: Mutex<Vec<String>>,
    dropped: AtomicUsize,
}

#[async_trait]
impl ApplicationCallbacks for RecordingCallbacks {
    async fn on_message(&self, message: Message, _link_id: &str, _service_id: &str) {
        self.messages.lock().await.push(message.text);
    }

    async fn on_queue_packet_dropped(&self, _connection_id: &str, _link_id: &str) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn producer_config() -> ProducerLinkConfig {
    ProducerLinkConfig {
        link_id: "recover-p1".into(),
        connection_id: "recover-conn".into(),
        destination: "recover-dest".into(),
        is_topic: false,
        service_id: Some("recover-orders".into()),
        queue_capacity: 50,
        persistence_size: 1000,
        request_reply: false,
        persistent: true,
        priority: 0,
        time_to_live_ms: 0,
        default_properties: HashMap::new(),
            cert_path: None,
    }
}

#[tokio::test]
async fn backlog_survives_restart_and_replays_once_broker_recovers() {
    let dir = tempfile::tempdir().unwrap();

    // "Before the crash": every send fails, so messages pile up in the
    // persistence log without ever being acknowledged as sent.
    {
        let facade = Facade::new(Arc::new(DownBroker), Arc::new(RecordingCallbacks::default()), 64, true)
            .with_persistence_dir(dir.path());
        facade.initialize().await.unwrap();
        facade
            .add_connection("recover-conn", "down://", "", "", "")
            .await
            .unwrap();
        facade.add_producer(producer_config()).await.unwrap();

        for i in 0..5 {
            facade
                .publish("recover-orders", Message::text("recover-orders", format!("m{i}")))
                .await
                .unwrap();
        }
        // Give the sender task a chance to attempt (and fail) every send.
        sleep(Duration::from_millis(100)).await;
        facade.close().await.unwrap();
    }

    // "After the restart": a fresh facade, same connection/link id and
    // persistence directory, now backed by a broker that actually works.
    let broker = LoopbackBroker::new();
    let callbacks = Arc::new(RecordingCallbacks::default());
    let facade = Facade::new(Arc::new(broker.clone()), callbacks.clone(), 64, true)
        .with_persistence_dir(dir.path());
    facade.initialize().await.unwrap();
    facade
        .add_connection("recover-conn", "loop://", "", "", "")
        .await
        .unwrap();

    // Wire up a consumer on the same destination before the producer
    // starts replaying, so replayed messages have somewhere to land.
    let conn = broker.create_connection("loop://", "", "", "").await.unwrap();
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let mut consumer = session
        .create_consumer(session.create_queue("recover-dest"), None)
        .await
        .unwrap();

    facade.add_producer(producer_config()).await.unwrap();

    for _ in 0..5 {
        let got = tokio::time::timeout(Duration::from_millis(500), consumer.receive())
            .await
            .expect("replayed message should arrive")
            .unwrap();
        assert!(got.text.starts_with('m'));
    }

    facade.close().await.unwrap();
}
