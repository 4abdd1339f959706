//! Network Layer
//!
//! WebSocket transport for the relay: the wire protocol, per-connection
//! handles, and the accept loop that feeds the relay engine.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{ConnectionError, ConnectionHandle, OutboundFrame};
pub use protocol::{Envelope, MessageKind};
pub use server::{RelayConfig, RelayServer, RelayServerError};
