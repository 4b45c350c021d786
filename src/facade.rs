//! # Facade
//!
//! The top-level engine applications drive: a lifecycle gate wrapping
//! the topology index, the broker connections/sessions, and the running
//! producer/consumer engines. Grounded on `ActiveManager.cpp`'s
//! `init`/`startConnections`/`sendData`/`destroyConnection` surface,
//! generalized from its single hard-coded message-bus wiring to the
//! connection/producer/consumer configuration carried by
//! [`crate::config::TopologyConfig`].

use crate::broker::{AckMode, BrokerClient, BrokerConnection, BrokerSession};
use crate::callback::{ApplicationCallbacks, CallbackDispatcher};
use crate::config::{ConsumerLinkConfig, ProducerLinkConfig, TopologyConfig};
use crate::consumer::{ConsumerConfig, ConsumerHandle};
use crate::error::CratewayError;
use crate::message::{Message, Parameter, ParameterStore};
use crate::producer::{ProducerConfig, ProducerHandle};
use crate::topology::Topology;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Lifecycle state of the facade, checked on every operation that
/// touches the topology or a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    NotInitialized,
    Initializing,
    Initialized,
    Closing,
    Closed,
}

struct ConnectionEntry {
    connection: Box<dyn BrokerConnection>,
    session: Arc<dyn BrokerSession>,
    handle: crate::topology::Handle,
}

/// The engine. Construct with [`Facade::new`], call
/// [`Facade::initialize`], then build up the topology with
/// [`Facade::add_connection`]/[`Facade::add_producer`]/[`Facade::add_consumer`]
/// (or [`Facade::load_topology`] to do all three from a config file).
pub struct Facade {
    broker_client: Arc<dyn BrokerClient>,
    callback: Arc<CallbackDispatcher>,
    topology: Topology,
    state: Mutex<FacadeState>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    producers: RwLock<HashMap<String, ProducerHandle>>,
    consumers: RwLock<HashMap<String, ConsumerHandle>>,
    persistence_dir: Option<std::path::PathBuf>,
    /// Original config each producer link was created with, kept around so
    /// [`Facade::set_link_connection`] can restart a producer engine
    /// against a different connection's session.
    producer_configs: RwLock<HashMap<String, ProducerLinkConfig>>,
    /// Producer links currently severed from their connection via
    /// [`Facade::destroy_link_connection`], so `publish` can distinguish
    /// "no producer engine because this is actually a consumer link
    /// sharing the service binding" from "no producer engine because this
    /// link was deliberately severed".
    severed_links: RwLock<std::collections::HashSet<String>>,
}

impl Facade {
    pub fn new(
        broker_client: Arc<dyn BrokerClient>,
        callbacks: Arc<dyn ApplicationCallbacks>,
        callback_queue_capacity: usize,
        serialize_consumption: bool,
    ) -> Self {
        Self {
            broker_client,
            callback: Arc::new(CallbackDispatcher::new(
                callback_queue_capacity,
                serialize_consumption,
                callbacks,
            )),
            topology: Topology::new(),
            state: Mutex::new(FacadeState::NotInitialized),
            connections: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            persistence_dir: None,
            producer_configs: RwLock::new(HashMap::new()),
            severed_links: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Root producer persistence files under `dir` instead of the process
    /// working directory. Used by tests so concurrent runs don't collide
    /// on the same filenames.
    pub fn with_persistence_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }

    /// Transition `NotInitialized -> Initializing -> Initialized`. Calling
    /// this a second time is an error rather than a silent no-op, since a
    /// caller doing so almost certainly has a lifecycle bug worth
    /// surfacing.
    pub async fn initialize(&self) -> Result<(), CratewayError> {
        let mut state = self.state.lock().await;
        if *state != FacadeState::NotInitialized {
            return Err(CratewayError::Input(format!(
                "cannot initialize from state {state:?}"
            )));
        }
        *state = FacadeState::Initializing;
        info!("initializing");
        *state = FacadeState::Initialized;
        Ok(())
    }

    pub async fn state(&self) -> FacadeState {
        *self.state.lock().await
    }

    async fn require_initialized(&self) -> Result<(), CratewayError> {
        if *self.state.lock().await != FacadeState::Initialized {
            return Err(CratewayError::Input("facade is not initialized".into()));
        }
        Ok(())
    }

    /// Open a broker connection and session, and register it in the
    /// topology.
    pub async fn add_connection(
        &self,
        connection_id: impl Into<String>,
        uri: &str,
        username: &str,
        password: &str,
        client_id: &str,
    ) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let connection_id = connection_id.into();
        let mut connection = self
            .broker_client
            .create_connection(uri, username, password, client_id)
            .await
            .map_err(|e| CratewayError::Broker(e.to_string()))?;
        connection
            .start()
            .await
            .map_err(|e| CratewayError::Broker(e.to_string()))?;
        let session: Arc<dyn BrokerSession> = Arc::from(
            connection
                .create_session(AckMode::Auto)
                .await
                .map_err(|e| CratewayError::Broker(e.to_string()))?,
        );
        let handle = self.topology.new_connection(connection_id.clone()).await;
        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                connection,
                session,
                handle,
            },
        );
        Ok(())
    }

    /// Start a producer link, binding it to a service for fan-out if
    /// `config.service_id` is set.
    pub async fn add_producer(&self, config: ProducerLinkConfig) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let connections = self.connections.read().await;
        let entry = connections
            .get(&config.connection_id)
            .ok_or_else(|| CratewayError::Input(format!("unknown connection {}", config.connection_id)))?;

        let link_handle = self
            .topology
            .new_link(config.link_id.clone(), entry.handle)
            .await
            .ok_or_else(|| CratewayError::Invariant("connection vanished while adding link".into()))?;
        if let Some(service_id) = &config.service_id {
            self.topology.bind_link_to_service(link_handle, service_id.clone()).await;
        }

        let handle = self.start_producer_engine(&config, entry.session.as_ref()).await?;
        drop(connections);
        self.producers.write().await.insert(config.link_id.clone(), handle);
        self.producer_configs.write().await.insert(config.link_id.clone(), config);
        Ok(())
    }

    async fn start_producer_engine(
        &self,
        config: &ProducerLinkConfig,
        session: &dyn BrokerSession,
    ) -> Result<ProducerHandle, CratewayError> {
        let destination = if config.is_topic {
            crate::broker::Destination::topic(config.destination.clone())
        } else {
            crate::broker::Destination::queue(config.destination.clone())
        };
        let mut default_properties = ParameterStore::new();
        for (k, v) in &config.default_properties {
            default_properties.insert(k.clone(), Parameter::String(v.clone()));
        }

        let producer_config = ProducerConfig {
            connection_id: config.connection_id.clone(),
            link_id: config.link_id.clone(),
            destination,
            queue_capacity: config.queue_capacity,
            persistence_size: config.persistence_size,
            request_reply: config.request_reply,
            persistent: config.persistent,
            priority: config.priority,
            time_to_live_ms: config.time_to_live_ms,
            default_properties,
            persistence_dir: self.persistence_dir.clone(),
        };
        ProducerHandle::start(producer_config, session, self.callback.clone()).await
    }

    /// Sever a link from its connection, stopping its running producer
    /// engine without forgetting the link or its service bindings. Fan-out
    /// publishes to a service this link is bound to will report an error
    /// for this link until [`Facade::set_link_connection`] rebinds it.
    pub async fn destroy_link_connection(&self, link_id: &str) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let link = self
            .topology
            .resolve_link(link_id)
            .await
            .ok_or_else(|| CratewayError::Input(format!("unknown link {link_id}")))?;
        self.topology.sever_link_connection(link).await;
        if let Some(producer) = self.producers.write().await.remove(link_id) {
            producer.close().await;
            self.severed_links.write().await.insert(link_id.to_string());
        }
        if let Some(consumer) = self.consumers.write().await.remove(link_id) {
            consumer.close().await;
        }
        Ok(())
    }

    /// Rebind a link (previously severed, or newly added) to a different
    /// connection, restarting its producer engine against that
    /// connection's session.
    pub async fn set_link_connection(&self, link_id: &str, connection_id: &str) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let link = self
            .topology
            .resolve_link(link_id)
            .await
            .ok_or_else(|| CratewayError::Input(format!("unknown link {link_id}")))?;
        let connections = self.connections.read().await;
        let entry = connections
            .get(connection_id)
            .ok_or_else(|| CratewayError::Input(format!("unknown connection {connection_id}")))?;
        if !self.topology.rebind_link_connection(link, entry.handle).await {
            return Err(CratewayError::Invariant("link vanished while rebinding".into()));
        }

        let configs = self.producer_configs.read().await;
        if let Some(config) = configs.get(link_id) {
            let mut config = config.clone();
            config.connection_id = connection_id.to_string();
            let handle = self.start_producer_engine(&config, entry.session.as_ref()).await?;
            drop(configs);
            drop(connections);
            self.producers.write().await.insert(link_id.to_string(), handle);
            self.producer_configs.write().await.insert(link_id.to_string(), config);
            self.severed_links.write().await.remove(link_id);
        }
        Ok(())
    }

    pub async fn add_consumer(&self, config: ConsumerLinkConfig) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let connections = self.connections.read().await;
        let entry = connections
            .get(&config.connection_id)
            .ok_or_else(|| CratewayError::Input(format!("unknown connection {}", config.connection_id)))?;

        let link_handle = self
            .topology
            .new_link(config.link_id.clone(), entry.handle)
            .await
            .ok_or_else(|| CratewayError::Invariant("connection vanished while adding link".into()))?;
        if let Some(service_id) = &config.service_id {
            self.topology.bind_link_to_service(link_handle, service_id.clone()).await;
        }

        let destination = if config.is_topic {
            crate::broker::Destination::topic(config.destination.clone())
        } else {
            crate::broker::Destination::queue(config.destination.clone())
        };
        // Client-ack needs its own session: the connection's shared session is
        // opened once, auto-ack, in `add_connection` and other links depend on
        // it staying that way.
        let ack_mode = if config.client_ack { AckMode::Client } else { AckMode::Auto };
        let session = if config.client_ack {
            Arc::from(
                entry
                    .connection
                    .create_session(AckMode::Client)
                    .await
                    .map_err(|e| CratewayError::Broker(e.to_string()))?,
            )
        } else {
            entry.session.clone()
        };
        let consumer_config = ConsumerConfig {
            connection_id: config.connection_id.clone(),
            link_id: config.link_id.clone(),
            service_id: config.service_id.clone().unwrap_or_default(),
            destination,
            durable: config.durable,
            client_id: String::new(),
            selector: config.selector.clone(),
            ack_mode,
        };
        let handle = ConsumerHandle::start(consumer_config, session, self.callback.clone()).await?;
        drop(connections);
        self.consumers.write().await.insert(config.link_id, handle);
        Ok(())
    }

    /// Build a whole topology from a config file in one call.
    pub async fn load_topology(&self, config: TopologyConfig) -> Result<(), CratewayError> {
        for connection in config.connections {
            self.add_connection(
                connection.connection_id,
                &connection.uri,
                &connection.username,
                &connection.password,
                &connection.client_id,
            )
            .await?;
        }
        for producer in config.producers {
            self.add_producer(producer).await?;
        }
        for consumer in config.consumers {
            self.add_consumer(consumer).await?;
        }
        Ok(())
    }

    /// Fan a message out to every producer link bound to `service_id`.
    /// Mirrors `ActiveManager::sendData`'s `servicesMMap.equal_range`
    /// walk: every bound link gets an attempt, and the first hard
    /// failure (one not explained by the link being mid-recovery) is
    /// returned after the rest have still been tried.
    pub async fn publish(&self, service_id: &str, message: Message) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let links = self.topology.links_by_service(service_id).await;
        if links.is_empty() {
            return Err(CratewayError::Input(format!("no producer bound to service {service_id}")));
        }
        let mut first_error = None;
        let producers = self.producers.read().await;
        for link in links {
            let Some(link_id) = self.topology.link_id(link).await else {
                continue;
            };
            let Some(producer) = producers.get(&link_id) else {
                if self.severed_links.read().await.contains(&link_id) {
                    first_error.get_or_insert(CratewayError::Input(format!("link {link_id} has no connection")));
                }
                continue;
            };
            if let Err(e) = producer.publish(message.clone()).await {
                warn!(link_id = %link_id, error = %e, "fan-out publish failed on one link");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn send_response(
        &self,
        link_id: &str,
        original: &Message,
        response: Message,
    ) -> Result<(), CratewayError> {
        self.require_initialized().await?;
        let consumers = self.consumers.read().await;
        let consumer = consumers
            .get(link_id)
            .ok_or_else(|| CratewayError::Input(format!("unknown consumer link {link_id}")))?;
        consumer.send_response(original, response).await
    }

    /// Tear everything down: `Initialized -> Closing -> Closed`.
    pub async fn close(&self) -> Result<(), CratewayError> {
        {
            let mut state = self.state.lock().await;
            if *state == FacadeState::Closed {
                return Ok(());
            }
            *state = FacadeState::Closing;
        }
        let mut producers = self.producers.write().await;
        for (_, producer) in producers.drain() {
            producer.close().await;
        }
        let mut consumers = self.consumers.write().await;
        for (_, consumer) in consumers.drain() {
            consumer.close().await;
        }
        let mut connections = self.connections.write().await;
        for (_, mut entry) in connections.drain() {
            let _ = entry.connection.close().await;
        }
        *self.state.lock().await = FacadeState::Closed;
        Ok(())
    }
}
