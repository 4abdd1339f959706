//! Room Registry
//!
//! Protected-network records: a network may be gated behind a shared
//! access code. Records are ephemeral; an hourly sweep expires any room
//! older than 24 hours, regardless of how often it was used.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::relay::canonical_network_name;

/// Minimum access code length, enforced by the administrative layer.
pub const MIN_ACCESS_CODE_LEN: usize = 4;
/// Maximum access code length, enforced by the administrative layer.
pub const MAX_ACCESS_CODE_LEN: usize = 32;

/// Stored protection record for one network.
#[derive(Debug, Clone)]
struct ProtectedRoom {
    access_code: String,
    created_at: DateTime<Utc>,
    access_count: u64,
}

/// Public view of a protected room. The access code is never exposed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    /// Canonical network name.
    pub network_name: String,
    /// When protection was created.
    pub created_at: DateTime<Utc>,
    /// Number of successful code validations.
    pub access_count: u64,
}

/// Registry of protected networks.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, ProtectedRoom>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect a network with an access code, overwriting any existing
    /// protection and resetting its creation time and access counter.
    ///
    /// Code length is the caller's responsibility (see the administrative
    /// layer); this method stores whatever it is given.
    pub async fn protect(&self, network_name: &str, access_code: &str) -> RoomInfo {
        let canonical = canonical_network_name(network_name);
        let room = ProtectedRoom {
            access_code: access_code.to_string(),
            created_at: Utc::now(),
            access_count: 0,
        };
        let info = RoomInfo {
            network_name: canonical.clone(),
            created_at: room.created_at,
            access_count: 0,
        };

        self.rooms.write().await.insert(canonical.clone(), room);
        info!(network = %canonical, "protected room created");
        info
    }

    /// Whether a network is currently protected.
    pub async fn is_protected(&self, network_name: &str) -> bool {
        let canonical = canonical_network_name(network_name);
        self.rooms.read().await.contains_key(&canonical)
    }

    /// Validate an access code against a network's protection.
    ///
    /// Exact string match; a successful validation increments the room's
    /// access counter. Returns false both for a wrong code and for a
    /// network that is not protected at all; callers cannot tell the two
    /// apart, and the ambiguity is kept deliberately.
    pub async fn validate(&self, network_name: &str, candidate_code: &str) -> bool {
        let canonical = canonical_network_name(network_name);
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&canonical) else {
            return false;
        };

        if room.access_code == candidate_code {
            room.access_count += 1;
            true
        } else {
            false
        }
    }

    /// Remove protection from a network. Returns whether any existed.
    pub async fn remove(&self, network_name: &str) -> bool {
        let canonical = canonical_network_name(network_name);
        let existed = self.rooms.write().await.remove(&canonical).is_some();
        if existed {
            info!(network = %canonical, "protected room removed");
        }
        existed
    }

    /// All protected rooms, in no particular order.
    pub async fn list(&self) -> Vec<RoomInfo> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(name, room)| RoomInfo {
                network_name: name.clone(),
                created_at: room.created_at,
                access_count: room.access_count,
            })
            .collect()
    }

    /// Delete every room older than `max_age`. Returns the removed names.
    ///
    /// Rooms are not kept alive by use; only creation time matters.
    pub async fn sweep_expired(&self, max_age: ChronoDuration) -> Vec<String> {
        self.sweep_expired_at(Utc::now(), max_age).await
    }

    /// Expiry sweep against an explicit clock reading.
    pub(crate) async fn sweep_expired_at(
        &self,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
    ) -> Vec<String> {
        let cutoff = now - max_age;
        let mut rooms = self.rooms.write().await;
        let expired: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| room.created_at < cutoff)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            rooms.remove(name);
            info!(network = %name, "expired protected room removed");
        }
        expired
    }

    /// Number of protected rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
