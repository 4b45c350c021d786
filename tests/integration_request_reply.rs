//! A request/reply producer stamps a correlation id and temporary reply
//! destination on every publish; a consumer on the request queue replies
//! via [`crateway::facade::Facade::send_response`], and the original
//! producer's own response-consumer task delivers that reply back to the
//! application callback.

use async_trait::async_trait;
use crateway::broker::loopback::LoopbackBroker;
use crateway::callback::ApplicationCallbacks;
use crateway::config::{ConsumerLinkConfig, ProducerLinkConfig};
use crateway::facade::Facade;
use crateway::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Replies to every request it receives, and records every reply it
/// receives back. Holds a `OnceLock<Facade>` so it can call
/// `send_response` from inside `on_message`, set after construction since
/// `Facade::new` needs the callbacks handle before it exists itself.
struct EchoingCallbacks {
    facade: OnceLock<Arc<Facade>>,
    replies: Mutex<Vec<String>>,
}

#[async_trait]
impl ApplicationCallbacks for EchoingCallbacks {
    async fn on_message(&self, message: Message, link_id: &str, _service_id: &str) {
        if link_id == "server-c1" {
            let facade = self.facade.get().expect("facade set before traffic starts");
            let reply = Message::text("requests", format!("echo:{}", message.text));
            facade.send_response(link_id, &message, reply).await.unwrap();
        } else {
            self.replies.lock().await.push(message.text);
        }
    }
}

#[tokio::test]
async fn reply_is_delivered_back_to_the_requesting_producer() {
    let broker = LoopbackBroker::new();
    let callbacks = Arc::new(EchoingCallbacks {
        facade: OnceLock::new(),
        replies: Mutex::new(Vec::new()),
    });
    let facade = Arc::new(Facade::new(Arc::new(broker), callbacks.clone(), 64, true));
    callbacks.facade.set(facade.clone()).ok().unwrap();

    facade.initialize().await.unwrap();
    facade
        .add_connection("rr-conn", "loop://", "", "", "")
        .await
        .unwrap();
    facade
        .add_consumer(ConsumerLinkConfig {
            link_id: "server-c1".into(),
            connection_id: "rr-conn".into(),
            destination: "requests".into(),
            is_topic: false,
            service_id: Some("requests".into()),
            durable: false,
            selector: None,
            client_ack: false,
            cert_path: None,
        })
        .await
        .unwrap();
    facade
        .add_producer(ProducerLinkConfig {
            link_id: "client-p1".into(),
            connection_id: "rr-conn".into(),
            destination: "requests".into(),
            is_topic: false,
            service_id: Some("requests".into()),
            queue_capacity: 50,
            persistence_size: 0,
            request_reply: true,
            persistent: true,
            priority: 0,
            time_to_live_ms: 0,
            default_properties: HashMap::new(),
            cert_path: None,
        })
        .await
        .unwrap();

    facade
        .publish("requests", Message::text("requests", "ping"))
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(callbacks.replies.lock().await.as_slice(), ["echo:ping"]);

    facade.close().await.unwrap();
}
