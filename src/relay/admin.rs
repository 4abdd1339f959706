//! Administrative Operations
//!
//! Synchronous management surface consumed by an external HTTP layer:
//! system broadcasts, network inspection, and room protection. Unlike the
//! relay path, these operations report errors; each error maps to an HTTP
//! status code so the collaborator can surface it directly.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::relay::canonical_network_name;
use crate::relay::registry::ClientRegistry;
use crate::relay::rooms::{RoomInfo, RoomRegistry, MAX_ACCESS_CODE_LEN, MIN_ACCESS_CODE_LEN};
use crate::relay::router::{BroadcastReport, MessageRouter, RouterError};

/// Errors surfaced by administrative operations.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// A required field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Access code length is outside the allowed range.
    #[error("access code must be between {MIN_ACCESS_CODE_LEN} and {MAX_ACCESS_CODE_LEN} characters")]
    InvalidAccessCode,

    /// The target network has no connected clients.
    #[error("no clients found in network: {0}")]
    NetworkNotFound(String),

    /// The network is not protected.
    #[error("room not found or not protected: {0}")]
    RoomNotFound(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdminError {
    /// HTTP status code the external layer should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingField(_) | Self::InvalidAccessCode => 400,
            Self::NetworkNotFound(_) | Self::RoomNotFound(_) => 404,
            Self::Internal(_) => 500,
        }
    }
}

impl From<RouterError> for AdminError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::NoClients(network) => Self::NetworkNotFound(network),
        }
    }
}

/// Per-client summary returned by network inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    /// Client id.
    pub client_id: String,
    /// Display name, defaulting to "Unknown".
    pub client_name: String,
    /// Device type hint, if supplied.
    pub device_type: Option<String>,
    /// Whether the transport was open at inspection time.
    pub connected: bool,
}

/// Snapshot of one network's membership and protection state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Canonical network name.
    pub network_name: String,
    /// Number of connected clients.
    pub client_count: usize,
    /// Whether the network is gated behind an access code.
    pub is_protected: bool,
    /// Per-client summaries, in join order.
    pub clients: Vec<ClientSummary>,
}

/// Administrative API over the relay's registries.
///
/// Every operation is idempotent except [`protect_room`](Self::protect_room),
/// which overwrites.
#[derive(Clone)]
pub struct AdminApi {
    registry: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
}

impl AdminApi {
    /// Create the admin surface over shared registries.
    pub fn new(
        registry: Arc<ClientRegistry>,
        rooms: Arc<RoomRegistry>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self { registry, rooms, router }
    }

    /// Broadcast a system message to every client of a network.
    pub async fn send_broadcast(
        &self,
        network_name: &str,
        message: &str,
        sender_label: Option<&str>,
    ) -> Result<BroadcastReport, AdminError> {
        if network_name.trim().is_empty() {
            return Err(AdminError::MissingField("networkName"));
        }
        if message.trim().is_empty() {
            return Err(AdminError::MissingField("message"));
        }

        let report = self.router.broadcast_system(network_name, message, sender_label).await?;
        info!(
            network = %report.network_name,
            sent = report.messages_sent,
            "administrative broadcast delivered"
        );
        Ok(report)
    }

    /// Inspect a network's membership and protection state.
    ///
    /// Unknown networks are not an error; they report zero clients.
    pub async fn network_info(&self, network_name: &str) -> Result<NetworkInfo, AdminError> {
        if network_name.trim().is_empty() {
            return Err(AdminError::MissingField("networkName"));
        }

        let canonical = canonical_network_name(network_name);
        let members = self.registry.list_network(&canonical).await;
        let clients = members
            .iter()
            .map(|m| ClientSummary {
                client_id: m.id.to_string(),
                client_name: m.client_name.clone().unwrap_or_else(|| "Unknown".to_string()),
                device_type: m.device_type.clone(),
                connected: m.connected(),
            })
            .collect();

        Ok(NetworkInfo {
            network_name: canonical.clone(),
            client_count: members.len(),
            is_protected: self.rooms.is_protected(&canonical).await,
            clients,
        })
    }

    /// Protect a network with an access code, overwriting any existing
    /// protection.
    pub async fn protect_room(
        &self,
        network_name: &str,
        access_code: &str,
    ) -> Result<RoomInfo, AdminError> {
        if network_name.trim().is_empty() {
            return Err(AdminError::MissingField("networkName"));
        }
        if access_code.is_empty() {
            return Err(AdminError::MissingField("accessCode"));
        }
        if access_code.len() < MIN_ACCESS_CODE_LEN || access_code.len() > MAX_ACCESS_CODE_LEN {
            return Err(AdminError::InvalidAccessCode);
        }

        Ok(self.rooms.protect(network_name, access_code).await)
    }

    /// Remove protection from a network.
    pub async fn remove_protection(&self, network_name: &str) -> Result<(), AdminError> {
        if network_name.trim().is_empty() {
            return Err(AdminError::MissingField("networkName"));
        }
        if self.rooms.remove(network_name).await {
            Ok(())
        } else {
            Err(AdminError::RoomNotFound(network_name.to_string()))
        }
    }

    /// List all protected rooms with creation time and access count.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        self.rooms.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::network::connection::{ConnectionHandle, OutboundFrame};
    use crate::relay::client::ClientMetadata;

    fn test_api() -> (AdminApi, Arc<ClientRegistry>) {
        let registry = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), 65536));
        (AdminApi::new(registry.clone(), rooms, router), registry)
    }

    async fn join(
        registry: &Arc<ClientRegistry>,
        network: &str,
        name: Option<&str>,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (handle, rx) = ConnectionHandle::channel(16);
        let metadata = ClientMetadata {
            client_name: name.map(str::to_string),
            device_type: None,
        };
        registry.register(handle, network, metadata).await;
        rx
    }

    #[tokio::test]
    async fn test_send_broadcast_validates_fields() {
        let (api, _registry) = test_api();

        let err = api.send_broadcast("", "hello", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = api.send_broadcast("net", "   ", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_send_broadcast_to_empty_network_is_404() {
        let (api, _registry) = test_api();
        let err = api.send_broadcast("ghost", "hello", None).await.unwrap_err();
        assert!(matches!(err, AdminError::NetworkNotFound(_)));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_send_broadcast_reports_counts() {
        let (api, registry) = test_api();
        let _a = join(&registry, "net", None).await;
        let _b = join(&registry, "net", None).await;

        let report = api.send_broadcast("net", "hello", None).await.unwrap();
        assert_eq!(report.clients_found, 2);
        assert_eq!(report.messages_sent, 2);
    }

    #[tokio::test]
    async fn test_network_info_reflects_members_and_protection() {
        let (api, registry) = test_api();
        let _rx = join(&registry, "Kitchen", Some("Toaster")).await;
        api.protect_room("kitchen", "secret").await.unwrap();

        let info = api.network_info("KITCHEN").await.unwrap();
        assert_eq!(info.network_name, "KITCHEN");
        assert_eq!(info.client_count, 1);
        assert!(info.is_protected);
        assert_eq!(info.clients[0].client_name, "Toaster");
        assert!(info.clients[0].connected);
    }

    #[tokio::test]
    async fn test_network_info_defaults_unknown_name() {
        let (api, registry) = test_api();
        let _rx = join(&registry, "net", None).await;

        let info = api.network_info("net").await.unwrap();
        assert_eq!(info.clients[0].client_name, "Unknown");
    }

    #[tokio::test]
    async fn test_protect_room_validates_code_length() {
        let (api, _registry) = test_api();

        assert!(matches!(
            api.protect_room("net", "123").await,
            Err(AdminError::InvalidAccessCode)
        ));
        assert!(matches!(
            api.protect_room("net", &"x".repeat(33)).await,
            Err(AdminError::InvalidAccessCode)
        ));

        let room = api.protect_room("net", "1234").await.unwrap();
        assert_eq!(room.network_name, "NET");
    }

    #[tokio::test]
    async fn test_remove_protection_404_when_absent() {
        let (api, _registry) = test_api();

        let err = api.remove_protection("net").await.unwrap_err();
        assert!(matches!(err, AdminError::RoomNotFound(_)));

        api.protect_room("net", "1234").await.unwrap();
        api.remove_protection("NET").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_rooms_exposes_counts_not_codes() {
        let (api, _registry) = test_api();
        api.protect_room("one", "1234").await.unwrap();
        api.protect_room("two", "5678").await.unwrap();

        let rooms = api.list_rooms().await;
        assert_eq!(rooms.len(), 2);

        let json = serde_json::to_string(&rooms).unwrap();
        assert!(!json.contains("1234"));
        assert!(!json.contains("5678"));
        assert!(json.contains("accessCount"));
    }
}
