//! # Topology Index
//!
//! The connection/link/service relationship graph: which links belong to
//! which connection, and which links are bound to which service for
//! fan-out delivery. Grounded on `ActiveManager.cpp`'s
//! `insertInMMap`/`saveConnection`/`insertInLinksMap`/`getLinksByConn`/
//! `getLinksByService`/`destroyServiceLink` family of methods.
//!
//! Connections and links are addressed by generational [`Handle`]s rather
//! than raw pointers or bare indices: removing a connection or link bumps
//! its slot's generation, so a handle captured before the removal can
//! never silently resolve to a reused slot afterward — it simply returns
//! `None`. This replaces the original's nullable-pointer bookkeeping,
//! where a dangling `ActiveConnection*`/`ActiveLink*` had to be guarded
//! by the caller remembering to null-check after every destroy.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// A generational handle into an [`Arena`]. Stays meaningful only while
/// the slot it names hasn't been reused by a later insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            Handle { index, generation: 0 }
        }
    }

    fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take();
        if value.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(handle.index);
        }
        value
    }

    fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation == handle.generation {
            slot.value.as_ref()
        } else {
            None
        }
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation == handle.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }
}

struct ConnectionRecord {
    connection_id: String,
}

struct LinkRecord {
    link_id: String,
    /// `None` while the link has been severed from its connection via
    /// [`Topology::sever_link_connection`] but is still bound to its
    /// services, awaiting [`Topology::rebind_link_connection`].
    connection: Option<Handle>,
}

/// The relationship graph, guarded by a single reader/writer lock —
/// lookups (service fan-out, link enumeration) take the read side;
/// creating or destroying a connection or link takes the write side.
#[derive(Default)]
pub struct Topology {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    connections: Option<Arena<ConnectionRecord>>,
    links: Option<Arena<LinkRecord>>,
    connection_by_id: HashMap<String, Handle>,
    link_by_id: HashMap<String, Handle>,
    links_by_connection: HashMap<Handle, Vec<Handle>>,
    links_by_service: HashMap<String, Vec<Handle>>,
    services_by_link: HashMap<Handle, Vec<String>>,
}

impl Inner {
    fn connections(&mut self) -> &mut Arena<ConnectionRecord> {
        self.connections.get_or_insert_with(Arena::new)
    }

    fn links(&mut self) -> &mut Arena<LinkRecord> {
        self.links.get_or_insert_with(Arena::new)
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn new_connection(&self, connection_id: impl Into<String>) -> Handle {
        let connection_id = connection_id.into();
        let mut inner = self.inner.write().await;
        let handle = inner.connections().insert(ConnectionRecord {
            connection_id: connection_id.clone(),
        });
        inner.connection_by_id.insert(connection_id, handle);
        inner.links_by_connection.insert(handle, Vec::new());
        handle
    }

    pub async fn new_link(&self, link_id: impl Into<String>, connection: Handle) -> Option<Handle> {
        let link_id = link_id.into();
        let mut inner = self.inner.write().await;
        if inner.connections().get(connection).is_none() {
            return None;
        }
        let handle = inner.links().insert(LinkRecord {
            link_id: link_id.clone(),
            connection: Some(connection),
        });
        inner.link_by_id.insert(link_id, handle);
        inner.links_by_connection.entry(connection).or_default().push(handle);
        inner.services_by_link.insert(handle, Vec::new());
        Some(handle)
    }

    /// Bind a link to a service, enabling it to receive fan-out sends
    /// addressed to that service.
    pub async fn bind_link_to_service(&self, link: Handle, service_id: impl Into<String>) {
        let service_id = service_id.into();
        let mut inner = self.inner.write().await;
        if inner.links().get(link).is_none() {
            return;
        }
        inner.links_by_service.entry(service_id.clone()).or_default().push(link);
        inner.services_by_link.entry(link).or_default().push(service_id);
    }

    pub async fn unbind_link_from_service(&self, link: Handle, service_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(links) = inner.links_by_service.get_mut(service_id) {
            links.retain(|&l| l != link);
        }
        if let Some(services) = inner.services_by_link.get_mut(&link) {
            services.retain(|s| s != service_id);
        }
    }

    /// Handles of every link currently bound to `service_id`, for fan-out
    /// delivery.
    pub async fn links_by_service(&self, service_id: &str) -> Vec<Handle> {
        let inner = self.inner.read().await;
        inner
            .links_by_service
            .get(service_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn links_by_connection(&self, connection: Handle) -> Vec<Handle> {
        let inner = self.inner.read().await;
        inner
            .links_by_connection
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connection_of_link(&self, link: Handle) -> Option<Handle> {
        let inner = self.inner.read().await;
        inner.links.as_ref()?.get(link)?.connection
    }

    /// Sever a link from its current connection without destroying the
    /// link or its service bindings, returning the connection it was
    /// attached to. Fan-out sends addressed to a service this link is
    /// bound to will fail for this link until it is rebound.
    pub async fn sever_link_connection(&self, link: Handle) -> Option<Handle> {
        let mut inner = self.inner.write().await;
        let old = inner.links().get_mut(link)?.connection.take()?;
        if let Some(siblings) = inner.links_by_connection.get_mut(&old) {
            siblings.retain(|&l| l != link);
        }
        Some(old)
    }

    /// Attach a previously severed (or freshly created) link to
    /// `connection`. Returns `false` if either handle is stale.
    pub async fn rebind_link_connection(&self, link: Handle, connection: Handle) -> bool {
        let mut inner = self.inner.write().await;
        if inner.connections().get(connection).is_none() {
            return false;
        }
        let Some(record) = inner.links().get_mut(link) else {
            return false;
        };
        record.connection = Some(connection);
        inner.links_by_connection.entry(connection).or_default().push(link);
        true
    }

    pub async fn resolve_connection(&self, connection_id: &str) -> Option<Handle> {
        self.inner.read().await.connection_by_id.get(connection_id).copied()
    }

    pub async fn resolve_link(&self, link_id: &str) -> Option<Handle> {
        self.inner.read().await.link_by_id.get(link_id).copied()
    }

    pub async fn link_id(&self, link: Handle) -> Option<String> {
        let inner = self.inner.read().await;
        inner.links.as_ref()?.get(link).map(|l| l.link_id.clone())
    }

    pub async fn connection_id(&self, connection: Handle) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .connections
            .as_ref()?
            .get(connection)
            .map(|c| c.connection_id.clone())
    }

    /// Remove a link and every service binding that referenced it.
    pub async fn destroy_link(&self, link: Handle) {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.links().remove(link) else {
            return;
        };
        inner.link_by_id.remove(&record.link_id);
        if let Some(connection) = record.connection {
            if let Some(siblings) = inner.links_by_connection.get_mut(&connection) {
                siblings.retain(|&l| l != link);
            }
        }
        // Collect affected services first so removing entries from
        // `links_by_service` doesn't mutate a map we're still iterating.
        let services = inner.services_by_link.remove(&link).unwrap_or_default();
        for service_id in services {
            if let Some(links) = inner.links_by_service.get_mut(&service_id) {
                links.retain(|&l| l != link);
            }
        }
    }

    /// Remove a connection and cascade-destroy every link it owns.
    pub async fn destroy_connection(&self, connection: Handle) {
        let link_handles = {
            let mut inner = self.inner.write().await;
            let Some(record) = inner.connections().remove(connection) else {
                return;
            };
            inner.connection_by_id.remove(&record.connection_id);
            inner.links_by_connection.remove(&connection).unwrap_or_default()
        };
        for link in link_handles {
            self.destroy_link(link).await;
        }
    }
}
