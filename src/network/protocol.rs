//! Wire Protocol
//!
//! JSON envelopes exchanged over the relay WebSocket connection.
//! Field names are camelCase on the wire for compatibility with the
//! browser client; unknown fields are ignored.

use serde::{Deserialize, Serialize};

use crate::relay::client::ClientId;

/// Message types recognized by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// First frame on a connection; joins a network.
    Join,
    /// Server reply to a successful join.
    Welcome,
    /// Chat message.
    Chat,
    /// File transfer offer/acceptance.
    Transfer,
    /// Connection signaling payload (e.g. WebRTC descriptions).
    Signal,
}

impl MessageKind {
    /// Whether the relay forwards this kind to other clients.
    ///
    /// `join` and `welcome` are connection-control frames and are never
    /// relayed, even if a peer sets a `direct` flag on them.
    pub fn is_relayable(&self) -> bool {
        matches!(self, Self::Chat | Self::Transfer | Self::Signal)
    }
}

/// Flat relay envelope.
///
/// The same shape is used for inbound frames and personalized outbound
/// copies. `client_id` is always overwritten by the router before
/// delivery; the value a peer sends is never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Recipient client id. Required when `direct` is true; set per
    /// recipient on broadcast fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Human-readable content (chat text, system notices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Opaque application payload (transfer metadata, signaling blobs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// True for one-to-one delivery, false for network broadcast.
    #[serde(default)]
    pub direct: bool,
    /// Sender client id, stamped by the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Network to join (join frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Display name (join frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Device type hint, e.g. "mobile" or "desktop" (join frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Access code for protected networks (join frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
}

impl Envelope {
    /// Parse an envelope from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Build the server's reply to a successful join.
    pub fn welcome(client_id: ClientId, network_name: &str, app_name: &str) -> Self {
        Self {
            kind: MessageKind::Welcome,
            target_id: Some(client_id.to_string()),
            message: Some(app_name.to_string()),
            payload: None,
            direct: true,
            client_id: Some(client_id.to_string()),
            network_name: Some(network_name.to_string()),
            client_name: None,
            device_type: None,
            access_code: None,
        }
    }

    /// Build a plain chat envelope (used by the administrative broadcast path).
    pub fn chat(message: String) -> Self {
        Self {
            kind: MessageKind::Chat,
            target_id: None,
            message: Some(message),
            payload: None,
            direct: false,
            client_id: None,
            network_name: None,
            client_name: None,
            device_type: None,
            access_code: None,
        }
    }
}
