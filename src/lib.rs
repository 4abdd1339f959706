//! # Drop Relay
//!
//! Presence and message-relay server for a local-network file/chat
//! sharing application. Clients join a shared "network" namespace over
//! WebSocket and exchange direct or broadcast envelopes through the
//! relay; a namespace can be gated behind a time-limited access code.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DROP RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  relay/          - Presence & relay engine (no socket I/O)  │
//! │  ├── client.rs   - Client records and liveness states       │
//! │  ├── registry.rs - Per-network membership index             │
//! │  ├── router.rs   - Envelope validation and dispatch         │
//! │  ├── rooms.rs    - Access-code protection with 24h expiry   │
//! │  ├── health.rs   - Broken / ping / idle sweeps              │
//! │  └── admin.rs    - Administrative operations                │
//! │                                                             │
//! │  network/        - WebSocket transport                      │
//! │  ├── protocol.rs - JSON wire envelopes                      │
//! │  ├── connection.rs - Per-connection outbound handle         │
//! │  └── server.rs   - Accept loop and join flow                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! None, on purpose. All state is in-memory and ephemeral; the relay is
//! best-effort with no queuing, acknowledgement, or retry. Malformed or
//! oversized inbound frames are dropped without a response, and a failed
//! delivery to one broadcast recipient never affects the others.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod relay;

// Re-export commonly used types
pub use network::connection::{ConnectionError, ConnectionHandle, OutboundFrame};
pub use network::protocol::{Envelope, MessageKind};
pub use network::server::{RelayConfig, RelayServer, RelayServerError};
pub use relay::admin::{AdminApi, AdminError, NetworkInfo};
pub use relay::canonical_network_name;
pub use relay::client::{ClientId, ClientMetadata, ClientSnapshot, Liveness};
pub use relay::health::{HealthConfig, HealthMonitor};
pub use relay::registry::ClientRegistry;
pub use relay::rooms::{RoomInfo, RoomRegistry};
pub use relay::router::{BroadcastReport, MessageRouter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
