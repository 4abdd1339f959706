//! Presence & Relay Engine
//!
//! Core state and logic: who is connected, which network they belong to,
//! how messages fan out, and when dead or idle clients get evicted. No
//! socket I/O happens here - the `network` layer drives these components.

pub mod admin;
pub mod client;
pub mod health;
pub mod registry;
pub mod rooms;
pub mod router;

pub use admin::{AdminApi, AdminError, ClientSummary, NetworkInfo};
pub use client::{Client, ClientId, ClientMetadata, ClientSnapshot, Liveness};
pub use health::{HealthConfig, HealthMonitor};
pub use registry::ClientRegistry;
pub use rooms::{RoomInfo, RoomRegistry, MAX_ACCESS_CODE_LEN, MIN_ACCESS_CODE_LEN};
pub use router::{BroadcastReport, MessageRouter, RouterError, API_SENDER_ID};

/// Canonical form of a network name: trimmed and upper-cased.
///
/// Applied at every registry and room boundary so that names differing
/// only in case resolve to the same entry. Collections themselves are
/// always keyed by the canonical form, never by caller input.
pub fn canonical_network_name(name: &str) -> String {
    name.trim().to_uppercase()
}
