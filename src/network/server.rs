//! WebSocket Relay Server
//!
//! Accept loop and per-connection tasks. Each connection gets a reader
//! loop (this module) and a writer task drained from the connection
//! handle's channel; the relay engine itself never touches sockets.
//!
//! A connection must join a network with its first frame before anything
//! is relayed. Joins into a protected network are validated against the
//! room registry; a bad code closes the connection without detail.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::network::connection::{ConnectionHandle, OutboundFrame};
use crate::network::protocol::{Envelope, MessageKind};
use crate::relay::admin::AdminApi;
use crate::relay::canonical_network_name;
use crate::relay::client::{ClientId, ClientMetadata};
use crate::relay::health::{HealthConfig, HealthMonitor};
use crate::relay::registry::ClientRegistry;
use crate::relay::rooms::RoomRegistry;
use crate::relay::router::MessageRouter;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes; larger frames are dropped
    /// before parsing.
    pub max_message_bytes: usize,
    /// Application name echoed in welcome frames.
    pub app_name: String,
    /// How long a connection may stay anonymous before it is dropped.
    /// The limit covers the whole pre-join phase, handshake included.
    pub join_timeout: Duration,
    /// Health sweep cadences and thresholds.
    pub health: HealthConfig,
    /// Protected-room expiry sweep interval.
    pub room_sweep_interval: Duration,
    /// Maximum protected-room age before expiry.
    pub room_max_age: ChronoDuration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".parse().expect("static address"),
            max_connections: 1000,
            max_message_bytes: 65536,
            app_name: "drop-relay".to_string(),
            join_timeout: Duration::from_secs(30),
            health: HealthConfig::default(),
            room_sweep_interval: Duration::from_secs(60 * 60),
            room_max_age: ChronoDuration::hours(24),
        }
    }
}

impl RelayConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("DROP_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("DROP_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5000);
        let bind_addr = format!("{}:{}", host, port)
            .parse()
            .unwrap_or(defaults.bind_addr);

        let max_message_bytes = std::env::var("DROP_RELAY_MAX_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_message_bytes);

        let app_name =
            std::env::var("DROP_RELAY_APP_NAME").unwrap_or_else(|_| defaults.app_name.clone());

        let idle_timeout = std::env::var("DROP_RELAY_IDLE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.health.idle_timeout);

        Self {
            bind_addr,
            max_message_bytes,
            app_name,
            health: HealthConfig { idle_timeout, ..defaults.health },
            ..defaults
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay server.
///
/// Owns the registries for its whole lifetime; collaborators receive
/// shared references. Created at startup, torn down by [`shutdown`]
/// (which also stops every sweep loop).
///
/// [`shutdown`]: Self::shutdown
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
    shutdown_tx: broadcast::Sender<()>,
    /// Live connection tasks, joined or not. The connection limit is
    /// enforced against this, not the registry, so anonymous connections
    /// cannot slip under it.
    active_connections: Arc<AtomicUsize>,
}

/// Counts a connection task for its whole lifetime, handshake included.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayServer {
    /// Create a new relay server.
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), config.max_message_bytes));

        Self {
            config,
            registry,
            rooms,
            router,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Administrative surface over this server's registries, for an
    /// external HTTP layer.
    pub fn admin(&self) -> AdminApi {
        AdminApi::new(self.registry.clone(), self.rooms.clone(), self.router.clone())
    }

    /// Run the server until shutdown.
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Relay server listening on {}", self.config.bind_addr);

        let monitor = Arc::new(HealthMonitor::new(self.registry.clone(), self.config.health.clone()));
        let mut sweep_handles = monitor.spawn(&self.shutdown_tx);
        sweep_handles.push(self.spawn_room_sweep());

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        for handle in sweep_handles {
            handle.abort();
        }

        Ok(())
    }

    /// Spawn the hourly protected-room expiry sweep.
    fn spawn_room_sweep(&self) -> tokio::task::JoinHandle<()> {
        let rooms = self.rooms.clone();
        let sweep_interval = self.config.room_sweep_interval;
        let max_age = self.config.room_max_age;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        rooms.sweep_expired(max_age).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let rooms = self.rooms.clone();
        let router = self.router.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let guard = ConnectionGuard::acquire(&self.active_connections);

        tokio::spawn(async move {
            let _guard = guard;
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (handle, mut outbound_rx) = ConnectionHandle::channel(64);

            // Writer task: drains the handle's channel onto the socket.
            let writer_task = tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let message = match frame {
                        OutboundFrame::Envelope(envelope) => match envelope.to_json() {
                            Ok(text) => Message::Text(text),
                            Err(e) => {
                                error!("Failed to serialize envelope: {}", e);
                                continue;
                            }
                        },
                        OutboundFrame::Ping => Message::Ping(Vec::new()),
                        OutboundFrame::Pong(payload) => Message::Pong(payload),
                        OutboundFrame::Close => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if ws_sender.send(message).await.is_err() {
                        break;
                    }
                }
            });

            // Reader loop. The connection stays anonymous until a join
            // frame registers it into a network, and must join before the
            // deadline or be dropped.
            let mut client_id: Option<ClientId> = None;
            let join_deadline = tokio::time::sleep(config.join_timeout);
            tokio::pin!(join_deadline);

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match client_id {
                                    Some(id) => {
                                        router.handle_frame(id, &text).await;
                                    }
                                    None => {
                                        match Self::handle_join(
                                            &text, &handle, &registry, &rooms, &config, addr,
                                        ).await {
                                            JoinOutcome::Joined(id) => client_id = Some(id),
                                            JoinOutcome::Pending => {}
                                            JoinOutcome::Rejected => break,
                                        }
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = handle.pong(payload);
                                if let Some(id) = client_id {
                                    registry.touch(id).await;
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {
                                if let Some(id) = client_id {
                                    registry.mark_pong(id).await;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Ok(_)) => {
                                // Binary and other frame types are not part
                                // of the protocol.
                                debug!("Ignoring non-text frame from {}", addr);
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                    // Registry eviction (broken/idle sweeps, remove) closes
                    // the handle; observing that here tears the socket and
                    // both tasks down even if the peer never answers the
                    // close handshake.
                    _ = handle.closed() => {
                        debug!("Connection {} closed by eviction", addr);
                        break;
                    }
                    _ = &mut join_deadline, if client_id.is_none() => {
                        debug!("Connection {} never joined, dropping", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup. Removing from the registry closes the handle, which
            // lets the writer flush the close frame and exit.
            match client_id {
                Some(id) => registry.remove(id).await,
                None => handle.close(),
            }
            // Dropping the last sender lets the writer drain and exit even
            // if the close frame could not be queued.
            drop(handle);
            let _ = writer_task.await;
            debug!("Connection {} cleaned up", addr);
        });
    }

    /// Process the first frame on a connection, which must be a join.
    async fn handle_join(
        text: &str,
        handle: &ConnectionHandle,
        registry: &Arc<ClientRegistry>,
        rooms: &Arc<RoomRegistry>,
        config: &RelayConfig,
        addr: SocketAddr,
    ) -> JoinOutcome {
        if text.len() > config.max_message_bytes {
            debug!("Oversized pre-join frame from {} dropped", addr);
            return JoinOutcome::Pending;
        }

        let envelope = match Envelope::from_json(text) {
            Ok(env) => env,
            Err(e) => {
                debug!("Unparsable pre-join frame from {}: {}", addr, e);
                return JoinOutcome::Pending;
            }
        };

        if envelope.kind != MessageKind::Join {
            debug!("Frame before join from {} dropped", addr);
            return JoinOutcome::Pending;
        }

        let Some(requested) = envelope.network_name.as_deref().filter(|n| !n.trim().is_empty())
        else {
            debug!("Join without network name from {} dropped", addr);
            return JoinOutcome::Pending;
        };

        if rooms.is_protected(requested).await {
            let code = envelope.access_code.as_deref().unwrap_or("");
            if !rooms.validate(requested, code).await {
                // No detail on purpose: a wrong code and an unprotected
                // room are indistinguishable to the peer.
                info!("Rejected join to protected network from {}", addr);
                return JoinOutcome::Rejected;
            }
        }

        let canonical = canonical_network_name(requested);
        let metadata = ClientMetadata {
            client_name: envelope.client_name.clone(),
            device_type: envelope.device_type.clone(),
        };
        let id = registry.register(handle.clone(), &canonical, metadata).await;

        if let Err(e) = handle.send(Envelope::welcome(id, &canonical, &config.app_name)) {
            warn!(client_id = %id, error = %e, "failed to send welcome");
        }
        JoinOutcome::Joined(id)
    }

    /// Shutdown the server and stop all sweep loops.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Live connection tasks, including ones that have not joined yet.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Clients registered into a network.
    pub async fn client_count(&self) -> usize {
        self.registry.client_count().await
    }

    /// Non-empty network count.
    pub async fn network_count(&self) -> usize {
        self.registry.network_count().await
    }
}

/// Result of processing a pre-join frame.
enum JoinOutcome {
    /// The client joined a network.
    Joined(ClientId),
    /// Frame dropped; the connection stays anonymous.
    Pending,
    /// The connection must be closed.
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_tungstenite::connect_async;

    /// Poll a condition until it holds or a couple of seconds pass.
    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Bind a local listener and feed accepted streams into the server.
    async fn spawn_accepting(server: &Arc<RelayServer>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                accept_server.handle_connection(stream, peer);
            }
        });
        addr
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_message_bytes, 65536);
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.health.ping_interval, Duration::from_secs(5));
        assert_eq!(config.room_max_age, ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = RelayServer::new(config);

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.client_count().await, 0);
        assert_eq!(server.network_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = RelayServer::new(config);
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_anonymous_connection_counts_toward_limit() {
        let server = Arc::new(RelayServer::new(RelayConfig::default()));
        let addr = spawn_accepting(&server).await;

        let (_ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        // The handshake is done but no join frame was sent: the connection
        // is visible to the limit while still absent from the registry.
        let counter = server.clone();
        wait_until(move || counter.connection_count() == 1, "connection task").await;
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_unjoined_connection_dropped_at_deadline() {
        let config = RelayConfig {
            join_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let server = Arc::new(RelayServer::new(config));
        let addr = spawn_accepting(&server).await;

        let (_ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let counter = server.clone();
        wait_until(move || counter.connection_count() == 1, "connection task").await;

        // Never joins; the deadline must reclaim the connection.
        let counter = server.clone();
        wait_until(move || counter.connection_count() == 0, "deadline teardown").await;
    }

    #[tokio::test]
    async fn test_registry_eviction_tears_down_connection() {
        let server = Arc::new(RelayServer::new(RelayConfig::default()));
        let addr = spawn_accepting(&server).await;

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"join","networkName":"evict-net"}"#.to_string(),
        ))
        .await
        .unwrap();

        let mut joined = false;
        for _ in 0..200 {
            if server.client_count().await == 1 {
                joined = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(joined, "client never registered");

        // Evict the client directly, as the idle sweep would.
        let members = server.registry.list_network("evict-net").await;
        server.registry.remove(members[0].id).await;

        // The reader and writer tasks must exit without the peer's help.
        let counter = server.clone();
        wait_until(move || counter.connection_count() == 0, "eviction teardown").await;
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_registers_and_welcomes() {
        let config = RelayConfig::default();
        let registry = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let (handle, mut rx) = ConnectionHandle::channel(8);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let text = r#"{"type":"join","networkName":"abcd","clientName":"Phone"}"#;
        let outcome =
            RelayServer::handle_join(text, &handle, &registry, &rooms, &config, addr).await;

        let JoinOutcome::Joined(id) = outcome else {
            panic!("expected join");
        };
        assert_eq!(registry.get(id).await.unwrap().network_name, "ABCD");

        match rx.try_recv() {
            Ok(OutboundFrame::Envelope(env)) => {
                assert_eq!(env.kind, MessageKind::Welcome);
                assert_eq!(env.client_id.as_deref(), Some(id.to_string().as_str()));
                assert_eq!(env.network_name.as_deref(), Some("ABCD"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_protected_network_requires_code() {
        let config = RelayConfig::default();
        let registry = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        rooms.protect("abcd", "1234").await;
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let (handle, _rx) = ConnectionHandle::channel(8);
        let wrong = r#"{"type":"join","networkName":"abcd","accessCode":"0000"}"#;
        assert!(matches!(
            RelayServer::handle_join(wrong, &handle, &registry, &rooms, &config, addr).await,
            JoinOutcome::Rejected
        ));

        let (handle, _rx) = ConnectionHandle::channel(8);
        let missing = r#"{"type":"join","networkName":"abcd"}"#;
        assert!(matches!(
            RelayServer::handle_join(missing, &handle, &registry, &rooms, &config, addr).await,
            JoinOutcome::Rejected
        ));

        let (handle, _rx) = ConnectionHandle::channel(8);
        let right = r#"{"type":"join","networkName":"ABCD","accessCode":"1234"}"#;
        assert!(matches!(
            RelayServer::handle_join(right, &handle, &registry, &rooms, &config, addr).await,
            JoinOutcome::Joined(_)
        ));
    }

    #[tokio::test]
    async fn test_non_join_frames_before_join_are_dropped() {
        let config = RelayConfig::default();
        let registry = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let (handle, _rx) = ConnectionHandle::channel(8);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        for text in [
            r#"{"type":"chat","message":"early"}"#,
            r#"{"type":"join"}"#,
            "not json",
        ] {
            assert!(matches!(
                RelayServer::handle_join(text, &handle, &registry, &rooms, &config, addr).await,
                JoinOutcome::Pending
            ));
        }
        assert_eq!(registry.client_count().await, 0);
    }
}
