//! Message Router
//!
//! Turns inbound frames into personalized outbound deliveries. Anything
//! that fails validation is dropped without a reply: the sender is an
//! untrusted peer and the relay must not become an error-information side
//! channel. Delivery is best-effort; one recipient's failure never aborts
//! the rest of a broadcast.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::network::protocol::Envelope;
use crate::relay::client::{ClientId, ClientSnapshot};
use crate::relay::registry::ClientRegistry;

/// Sender id stamped on administrative broadcasts.
pub const API_SENDER_ID: &str = "api-sender";

/// Errors from the administrative broadcast path.
///
/// Peer-originated relay traffic never produces errors; this type exists
/// only for the path where the caller is an API consumer that expects a
/// report.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The target network has no connected clients.
    #[error("no clients found in network: {0}")]
    NoClients(String),
}

/// Outcome of an administrative broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    /// Canonical network name the broadcast targeted.
    pub network_name: String,
    /// Clients present in the network when the broadcast ran.
    pub clients_found: usize,
    /// Personalized copies actually queued for delivery.
    pub messages_sent: usize,
}

/// Routes envelopes between clients of the same network.
pub struct MessageRouter {
    registry: Arc<ClientRegistry>,
    max_message_bytes: usize,
}

impl MessageRouter {
    /// Create a router over the given registry.
    pub fn new(registry: Arc<ClientRegistry>, max_message_bytes: usize) -> Self {
        Self { registry, max_message_bytes }
    }

    /// Size bound applied to inbound frames before parsing.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Handle one raw inbound text frame from a registered client.
    ///
    /// Oversized frames are dropped before parsing (bounds abuse cost),
    /// unparsable frames are dropped after, and neither produces any
    /// response. Returns the number of deliveries queued.
    pub async fn handle_frame(&self, sender_id: ClientId, raw: &str) -> usize {
        if raw.len() > self.max_message_bytes {
            debug!(client_id = %sender_id, bytes = raw.len(), "oversized frame dropped");
            return 0;
        }

        let envelope = match Envelope::from_json(raw) {
            Ok(env) => env,
            Err(e) => {
                debug!(client_id = %sender_id, error = %e, "unparsable frame dropped");
                return 0;
            }
        };

        self.dispatch(sender_id, envelope).await
    }

    /// Dispatch a parsed envelope from a registered client.
    ///
    /// Refreshes the sender's activity, then delivers either to the one
    /// direct target or to every other member of the sender's network.
    pub async fn dispatch(&self, sender_id: ClientId, envelope: Envelope) -> usize {
        let Some(sender) = self.registry.get(sender_id).await else {
            debug!(client_id = %sender_id, "frame from unregistered client dropped");
            return 0;
        };
        self.registry.touch(sender_id).await;

        if !envelope.kind.is_relayable() {
            debug!(client_id = %sender_id, kind = ?envelope.kind, "non-relayable frame dropped");
            return 0;
        }

        if envelope.direct {
            self.deliver_direct(&sender, envelope).await
        } else {
            self.deliver_broadcast(&sender, envelope).await
        }
    }

    /// Administrative broadcast: deliver a system chat message to every
    /// client of a network, without a live sender connection.
    ///
    /// The message text is prefixed with the sender label and the fixed
    /// [`API_SENDER_ID`] is stamped as the sender id.
    pub async fn broadcast_system(
        &self,
        network_name: &str,
        message: &str,
        sender_label: Option<&str>,
    ) -> Result<BroadcastReport, RouterError> {
        let members = self.registry.list_network(network_name).await;
        if members.is_empty() {
            return Err(RouterError::NoClients(network_name.to_string()));
        }

        let label = sender_label.unwrap_or("API");
        let template = Envelope::chat(format!("[{}] {}", label, message));
        let network = members[0].network_name.clone();

        let mut sent = 0;
        for recipient in &members {
            let mut copy = template.clone();
            copy.target_id = Some(recipient.id.to_string());
            copy.client_id = Some(API_SENDER_ID.to_string());
            match recipient.connection.send(copy) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(client_id = %recipient.id, error = %e, "system broadcast delivery failed");
                }
            }
        }

        Ok(BroadcastReport {
            network_name: network,
            clients_found: members.len(),
            messages_sent: sent,
        })
    }

    async fn deliver_direct(&self, sender: &ClientSnapshot, envelope: Envelope) -> usize {
        // A direct envelope without a parseable target has nowhere to go.
        let Some(target_id) = envelope
            .target_id
            .as_deref()
            .and_then(|raw| raw.parse::<ClientId>().ok())
        else {
            debug!(client_id = %sender.id, "direct frame without valid target dropped");
            return 0;
        };

        let Some(recipient) = self.registry.get(target_id).await else {
            debug!(client_id = %sender.id, target = %target_id, "direct target not found, dropped");
            return 0;
        };

        // Direct delivery never crosses network boundaries.
        if recipient.network_name != sender.network_name {
            debug!(client_id = %sender.id, target = %target_id, "cross-network direct frame dropped");
            return 0;
        }

        match recipient.connection.send(Self::personalize(&envelope, sender.id, recipient.id)) {
            Ok(()) => 1,
            Err(e) => {
                warn!(client_id = %recipient.id, error = %e, "direct delivery failed");
                0
            }
        }
    }

    async fn deliver_broadcast(&self, sender: &ClientSnapshot, envelope: Envelope) -> usize {
        let members = self.registry.list_network(&sender.network_name).await;

        let mut sent = 0;
        for recipient in members.iter().filter(|m| m.id != sender.id) {
            match recipient.connection.send(Self::personalize(&envelope, sender.id, recipient.id)) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Isolated: remaining recipients still get their copy.
                    warn!(client_id = %recipient.id, error = %e, "broadcast delivery failed");
                }
            }
        }
        sent
    }

    fn personalize(envelope: &Envelope, sender: ClientId, recipient: ClientId) -> Envelope {
        let mut copy = envelope.clone();
        copy.target_id = Some(recipient.to_string());
        copy.client_id = Some(sender.to_string());
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::network::connection::{ConnectionHandle, OutboundFrame};
    use crate::network::protocol::MessageKind;
    use crate::relay::client::ClientMetadata;

    struct Peer {
        id: ClientId,
        rx: mpsc::Receiver<OutboundFrame>,
    }

    impl Peer {
        fn next_envelope(&mut self) -> Option<Envelope> {
            match self.rx.try_recv() {
                Ok(OutboundFrame::Envelope(env)) => Some(env),
                _ => None,
            }
        }
    }

    async fn join(registry: &Arc<ClientRegistry>, network: &str) -> Peer {
        let (handle, rx) = ConnectionHandle::channel(16);
        let id = registry.register(handle, network, ClientMetadata::default()).await;
        Peer { id, rx }
    }

    fn router(registry: &Arc<ClientRegistry>) -> MessageRouter {
        MessageRouter::new(registry.clone(), 65536)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_other_members() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let mut a = join(&registry, "ABCD").await;
        let mut b = join(&registry, "ABCD").await;
        let mut c = join(&registry, "ABCD").await;

        let raw = r#"{"type":"chat","message":"hello","direct":false}"#;
        let sent = router.handle_frame(a.id, raw).await;
        assert_eq!(sent, 2);

        for peer in [&mut b, &mut c] {
            let env = peer.next_envelope().expect("missing broadcast copy");
            assert_eq!(env.kind, MessageKind::Chat);
            assert_eq!(env.client_id.as_deref(), Some(a.id.to_string().as_str()));
            assert_eq!(env.target_id.as_deref(), Some(peer.id.to_string().as_str()));
        }
        // The sender receives nothing.
        assert!(a.next_envelope().is_none());
    }

    #[tokio::test]
    async fn test_direct_message_reaches_only_target() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "net").await;
        let mut b = join(&registry, "net").await;
        let mut c = join(&registry, "net").await;

        let raw = format!(
            r#"{{"type":"signal","payload":"sdp","direct":true,"targetId":"{}"}}"#,
            b.id
        );
        assert_eq!(router.handle_frame(a.id, &raw).await, 1);

        let env = b.next_envelope().unwrap();
        assert_eq!(env.payload.as_deref(), Some("sdp"));
        assert_eq!(env.client_id.as_deref(), Some(a.id.to_string().as_str()));
        assert!(c.next_envelope().is_none());
    }

    #[tokio::test]
    async fn test_direct_to_unknown_target_is_dropped() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "net").await;

        let raw = format!(
            r#"{{"type":"chat","message":"x","direct":true,"targetId":"{}"}}"#,
            ClientId::new()
        );
        assert_eq!(router.handle_frame(a.id, &raw).await, 0);
    }

    #[tokio::test]
    async fn test_direct_never_crosses_networks() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "one").await;
        let mut b = join(&registry, "two").await;

        let raw = format!(
            r#"{{"type":"chat","message":"x","direct":true,"targetId":"{}"}}"#,
            b.id
        );
        assert_eq!(router.handle_frame(a.id, &raw).await, 0);
        assert!(b.next_envelope().is_none());
    }

    #[tokio::test]
    async fn test_spoofed_client_id_is_overwritten() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "net").await;
        let mut b = join(&registry, "net").await;

        let raw = r#"{"type":"chat","message":"x","direct":false,"clientId":"someone-else"}"#;
        router.handle_frame(a.id, raw).await;

        let env = b.next_envelope().unwrap();
        assert_eq!(env.client_id.as_deref(), Some(a.id.to_string().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_dropped_without_state_change() {
        let registry = Arc::new(ClientRegistry::new());
        let router = MessageRouter::new(registry.clone(), 64);
        let a = join(&registry, "net").await;
        let mut b = join(&registry, "net").await;

        tokio::time::advance(tokio::time::Duration::from_secs(200)).await;

        let padding = "y".repeat(128);
        let raw = format!(r#"{{"type":"chat","message":"{}","direct":false}}"#, padding);
        assert_eq!(router.handle_frame(a.id, &raw).await, 0);
        assert!(b.next_envelope().is_none());

        // The dropped frame must not count as sender activity: pushing the
        // clock past the idle threshold still evicts the sender.
        tokio::time::advance(tokio::time::Duration::from_secs(101)).await;
        let removed = registry.remove_idle(tokio::time::Duration::from_secs(300)).await;
        assert!(removed.contains(&a.id));
    }

    #[tokio::test]
    async fn test_malformed_and_non_relayable_frames_dropped() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "net").await;
        let mut b = join(&registry, "net").await;

        assert_eq!(router.handle_frame(a.id, "{{{").await, 0);
        assert_eq!(router.handle_frame(a.id, r#"{"type":"join","networkName":"net"}"#).await, 0);
        assert_eq!(router.handle_frame(a.id, r#"{"type":"welcome"}"#).await, 0);
        assert!(b.next_envelope().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_isolated_per_recipient() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let a = join(&registry, "net").await;
        let b = join(&registry, "net").await;
        let mut c = join(&registry, "net").await;

        // b's writer task is gone; delivery to b fails.
        drop(b.rx);

        let raw = r#"{"type":"chat","message":"hi","direct":false}"#;
        assert_eq!(router.handle_frame(a.id, raw).await, 1);
        assert!(c.next_envelope().is_some());
    }

    #[tokio::test]
    async fn test_system_broadcast_labels_and_counts() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);
        let mut a = join(&registry, "net").await;
        let mut b = join(&registry, "net").await;

        let report = router
            .broadcast_system("NET", "maintenance at noon", Some("ops"))
            .await
            .unwrap();
        assert_eq!(report.clients_found, 2);
        assert_eq!(report.messages_sent, 2);
        assert_eq!(report.network_name, "NET");

        for peer in [&mut a, &mut b] {
            let env = peer.next_envelope().unwrap();
            assert_eq!(env.message.as_deref(), Some("[ops] maintenance at noon"));
            assert_eq!(env.client_id.as_deref(), Some(API_SENDER_ID));
            assert_eq!(env.target_id.as_deref(), Some(peer.id.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn test_system_broadcast_to_empty_network_errors() {
        let registry = Arc::new(ClientRegistry::new());
        let router = router(&registry);

        let result = router.broadcast_system("ghost-town", "anyone?", None).await;
        assert!(matches!(result, Err(RouterError::NoClients(_))));
    }
}
