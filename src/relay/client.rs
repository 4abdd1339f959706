//! Client Records
//!
//! A client is one connected device: its identity, descriptive metadata,
//! the network it joined, and the liveness bookkeeping the health sweeps
//! maintain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::network::connection::ConnectionHandle;

/// Opaque unique client identifier, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Client-supplied descriptive metadata, captured at join time.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    /// Display name shown to other clients.
    pub client_name: Option<String>,
    /// Device type hint, e.g. "mobile" or "desktop".
    pub device_type: Option<String>,
}

/// Liveness state maintained by the health sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Responding normally.
    Alive,
    /// A ping probe is outstanding.
    AwaitingPong,
    /// Missed its pong deadline; removed by the next broken sweep.
    Dead,
}

/// One connected client. Owned exclusively by the registry.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier, immutable.
    pub id: ClientId,
    /// Descriptive metadata.
    pub metadata: ClientMetadata,
    /// Canonical network name, immutable after join.
    pub network_name: String,
    /// Outbound side of the client's connection.
    pub connection: ConnectionHandle,
    /// Last inbound frame or successful pong.
    pub last_activity: Instant,
    /// Current liveness state.
    pub liveness: Liveness,
}

impl Client {
    /// Create a client record. The caller canonicalizes `network_name`.
    pub fn new(network_name: String, metadata: ClientMetadata, connection: ConnectionHandle) -> Self {
        Self {
            id: ClientId::new(),
            metadata,
            network_name,
            connection,
            last_activity: Instant::now(),
            liveness: Liveness::Alive,
        }
    }

    /// Refresh the activity timestamp (any inbound frame).
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Record a pong: back to alive, counts as activity.
    pub fn mark_pong(&mut self) {
        self.liveness = Liveness::Alive;
        self.last_activity = Instant::now();
    }

    /// Whether the broken sweep should evict this client.
    pub fn is_broken(&self) -> bool {
        self.connection.is_closed() || self.liveness == Liveness::Dead
    }

    /// Point-in-time view for callers outside the registry lock.
    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id,
            network_name: self.network_name.clone(),
            client_name: self.metadata.client_name.clone(),
            device_type: self.metadata.device_type.clone(),
            liveness: self.liveness,
            connection: self.connection.clone(),
        }
    }
}

/// Point-in-time view of a client, safe to hold across awaits.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Unique identifier.
    pub id: ClientId,
    /// Canonical network name.
    pub network_name: String,
    /// Display name, if supplied.
    pub client_name: Option<String>,
    /// Device type hint, if supplied.
    pub device_type: Option<String>,
    /// Liveness state at snapshot time.
    pub liveness: Liveness,
    /// Connection handle for delivery.
    pub connection: ConnectionHandle,
}

impl ClientSnapshot {
    /// Whether the transport was still open at snapshot time.
    pub fn connected(&self) -> bool {
        !self.connection.is_closed()
    }
}
