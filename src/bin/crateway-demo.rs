//! # Crateway Demo
//!
//! Exercises the full facade pipeline against the in-memory loopback
//! broker: a connection, a producer fanning out to two consumers bound
//! to the same service, and a small burst of published messages.
//! Logging setup mirrors the teacher benchmark suite's `main.rs`: a
//! colorized stdout layer plus a detailed rolling file layer, both
//! driven by `-v`/`-vv` verbosity flags.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use crateway::broker::loopback::LoopbackBroker;
use crateway::callback::ApplicationCallbacks;
use crateway::config::ProducerLinkConfig;
use crateway::facade::Facade;
use crateway::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use crateway::logging::ColorizedFormatter;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs a small publish/consume demo against the loopback broker")]
struct Args {
    /// Increase logging verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress the colorized stdout summary; only the log file is written.
    #[arg(long)]
    quiet: bool,

    /// Write the detailed log to this path instead of the default rolling file.
    #[arg(long)]
    log_file: Option<String>,

    /// Number of messages to publish.
    #[arg(long, default_value_t = 20)]
    messages: usize,
}

struct CountingCallbacks {
    received: AtomicUsize,
}

#[async_trait]
impl ApplicationCallbacks for CountingCallbacks {
    async fn on_message(&self, message: Message, link_id: &str, _service_id: &str) {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        info!(link_id, text = %message.text, count, "message delivered");
    }

    async fn on_exception(&self, error: &str) {
        tracing::error!(error, "broker exception");
    }

    async fn on_queue_packet_dropped(&self, connection_id: &str, link_id: &str) {
        tracing::warn!(connection_id, link_id, "queue full, entering recovery mode");
    }

    async fn on_queue_ready(&self, connection_id: &str, link_id: &str) {
        tracing::info!(connection_id, link_id, "queue ready again");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let file_appender = match args.log_file.as_deref() {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("crateway-demo.log"));
            tracing_appender::rolling::daily(dir, name)
        }
        None => tracing_appender::rolling::daily(".", "crateway-demo.log"),
    };
    let (non_blocking_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let detailed_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_filter(log_level)
        .boxed();

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    info!("starting crateway demo");

    let callbacks = Arc::new(CountingCallbacks {
        received: AtomicUsize::new(0),
    });
    let broker = LoopbackBroker::new();
    let facade = Facade::new(Arc::new(broker.clone()), callbacks.clone(), 256, true);
    facade.initialize().await?;
    facade.add_connection("c1", "loop://", "", "", "demo").await?;

    facade
        .add_producer(ProducerLinkConfig {
            link_id: "p-east".into(),
            connection_id: "c1".into(),
            destination: "orders-east".into(),
            is_topic: false,
            service_id: Some("orders".into()),
            queue_capacity: 100,
            persistence_size: 0,
            request_reply: false,
            persistent: true,
            priority: 0,
            time_to_live_ms: 0,
            default_properties: HashMap::new(),
            cert_path: None,
        })
        .await?;
    facade
        .add_producer(ProducerLinkConfig {
            link_id: "p-west".into(),
            connection_id: "c1".into(),
            destination: "orders-west".into(),
            is_topic: false,
            service_id: Some("orders".into()),
            queue_capacity: 100,
            persistence_size: 0,
            request_reply: false,
            persistent: true,
            priority: 0,
            time_to_live_ms: 0,
            default_properties: HashMap::new(),
            cert_path: None,
        })
        .await?;

    facade
        .add_consumer(crateway::config::ConsumerLinkConfig {
            link_id: "k-east".into(),
            connection_id: "c1".into(),
            destination: "orders-east".into(),
            is_topic: false,
            service_id: None,
            durable: false,
            selector: None,
            client_ack: false,
            cert_path: None,
        })
        .await?;
    facade
        .add_consumer(crateway::config::ConsumerLinkConfig {
            link_id: "k-west".into(),
            connection_id: "c1".into(),
            destination: "orders-west".into(),
            is_topic: false,
            service_id: None,
            durable: false,
            selector: None,
            client_ack: false,
            cert_path: None,
        })
        .await?;

    for i in 0..args.messages {
        facade
            .publish("orders", Message::text("orders", format!("order-{i}")))
            .await?;
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    facade.close().await?;

    info!(
        delivered = callbacks.received.load(Ordering::SeqCst),
        "demo complete"
    );
    Ok(())
}
