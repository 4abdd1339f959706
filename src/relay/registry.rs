//! Client Registry
//!
//! In-memory set of connected clients, indexed by canonical network name.
//! The registry is the sole owner of client records and their connection
//! handles; collaborators (router, health monitor) go through its methods
//! and receive snapshots, never references into the maps.
//!
//! Every public operation takes the inner lock exactly once for its whole
//! duration, so no two registry mutations interleave at sub-operation
//! granularity. Snapshots carry connection handles out of the lock so
//! socket I/O never happens while it is held.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::network::connection::ConnectionHandle;
use crate::relay::canonical_network_name;
use crate::relay::client::{Client, ClientId, ClientMetadata, ClientSnapshot, Liveness};

#[derive(Default)]
struct RegistryInner {
    /// All clients by id.
    clients: HashMap<ClientId, Client>,
    /// Membership index: canonical network name -> client ids in join order.
    networks: HashMap<String, Vec<ClientId>>,
}

/// Registry of active clients grouped by network.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client under `network_name`.
    ///
    /// Never fails: joining an unknown network creates the group. Returns
    /// the assigned id.
    pub async fn register(
        &self,
        connection: ConnectionHandle,
        network_name: &str,
        metadata: ClientMetadata,
    ) -> ClientId {
        let canonical = canonical_network_name(network_name);
        let client = Client::new(canonical.clone(), metadata, connection);
        let id = client.id;

        let mut inner = self.inner.write().await;
        inner.networks.entry(canonical.clone()).or_default().push(id);
        inner.clients.insert(id, client);
        info!(client_id = %id, network = %canonical, "client registered");
        id
    }

    /// Remove a client, closing its connection if still open. Idempotent.
    ///
    /// Removing the last member of a network drops the group entry.
    pub async fn remove(&self, client_id: ClientId) {
        let mut inner = self.inner.write().await;
        let Some(client) = inner.clients.remove(&client_id) else {
            return;
        };

        client.connection.close();
        if let Some(members) = inner.networks.get_mut(&client.network_name) {
            members.retain(|id| *id != client_id);
            if members.is_empty() {
                inner.networks.remove(&client.network_name);
            }
        }
        info!(client_id = %client_id, network = %client.network_name, "client removed");
    }

    /// Current members of a network, in join order. Empty if none.
    pub async fn list_network(&self, network_name: &str) -> Vec<ClientSnapshot> {
        let canonical = canonical_network_name(network_name);
        let inner = self.inner.read().await;
        let Some(members) = inner.networks.get(&canonical) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| inner.clients.get(id))
            .map(Client::snapshot)
            .collect()
    }

    /// Look up a single client.
    pub async fn get(&self, client_id: ClientId) -> Option<ClientSnapshot> {
        let inner = self.inner.read().await;
        inner.clients.get(&client_id).map(Client::snapshot)
    }

    /// Refresh a client's activity timestamp (any inbound frame).
    pub async fn touch(&self, client_id: ClientId) {
        let mut inner = self.inner.write().await;
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.touch();
        }
    }

    /// Record a pong from a client: back to alive, counts as activity.
    pub async fn mark_pong(&self, client_id: ClientId) {
        let mut inner = self.inner.write().await;
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.mark_pong();
        }
    }

    /// Advance liveness for one ping round and return the handles to probe.
    ///
    /// Clients still awaiting a pong from the previous round are marked
    /// dead (the broken sweep evicts them); alive clients with no recent
    /// activity move to awaiting-pong. Every live client gets probed to
    /// keep intermediary proxies from timing out the connection.
    pub async fn begin_ping_round(&self, activity_grace: Duration) -> Vec<(ClientId, ConnectionHandle)> {
        let now = Instant::now();
        let mut to_ping = Vec::new();

        let mut inner = self.inner.write().await;
        for (id, client) in inner.clients.iter_mut() {
            match client.liveness {
                Liveness::AwaitingPong => {
                    debug!(client_id = %id, "pong deadline missed, marking dead");
                    client.liveness = Liveness::Dead;
                }
                Liveness::Alive => {
                    if now.duration_since(client.last_activity) >= activity_grace {
                        client.liveness = Liveness::AwaitingPong;
                    }
                    to_ping.push((*id, client.connection.clone()));
                }
                Liveness::Dead => {}
            }
        }
        to_ping
    }

    /// Remove every client whose connection is closed or liveness is dead.
    /// Returns the removed ids.
    pub async fn remove_broken(&self) -> Vec<ClientId> {
        let mut inner = self.inner.write().await;
        let broken: Vec<ClientId> = inner
            .clients
            .iter()
            .filter(|(_, c)| c.is_broken())
            .map(|(id, _)| *id)
            .collect();

        for id in &broken {
            Self::remove_locked(&mut inner, *id);
        }
        broken
    }

    /// Remove every client idle for longer than `threshold`, regardless of
    /// transport state. Returns the removed ids.
    pub async fn remove_idle(&self, threshold: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let idle: Vec<ClientId> = inner
            .clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > threshold)
            .map(|(id, _)| *id)
            .collect();

        for id in &idle {
            Self::remove_locked(&mut inner, *id);
        }
        idle
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Number of non-empty networks.
    pub async fn network_count(&self) -> usize {
        self.inner.read().await.networks.len()
    }

    fn remove_locked(inner: &mut RegistryInner, client_id: ClientId) {
        if let Some(client) = inner.clients.remove(&client_id) {
            client.connection.close();
            if let Some(members) = inner.networks.get_mut(&client.network_name) {
                members.retain(|id| *id != client_id);
                if members.is_empty() {
                    inner.networks.remove(&client.network_name);
                }
            }
        }
    }
}
