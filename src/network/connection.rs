//! Connection Handle
//!
//! Cheap-to-clone handle over one WebSocket connection's outbound side.
//! All writes go through an mpsc channel drained by a per-connection
//! writer task; the handle itself never touches the socket, so registry
//! operations can hand out sends without holding locks across I/O.
//!
//! Closure is observable: [`ConnectionHandle::closed`] resolves once any
//! clone calls [`ConnectionHandle::close`], which is how registry
//! eviction reaches into the connection's reader loop and tears the
//! transport down.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::network::protocol::Envelope;

/// Frames pushed to a connection's writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    /// JSON envelope to serialize and send as a text frame.
    Envelope(Envelope),
    /// Transport-level keep-alive probe.
    Ping,
    /// Reply to a client-initiated ping.
    Pong(Vec<u8>),
    /// Orderly close of the connection.
    Close,
}

/// Errors from sending through a connection handle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection is closed or closing.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full; the frame was dropped (best-effort relay).
    #[error("outbound queue full")]
    QueueFull,
}

/// Handle to one client connection.
///
/// The owning [`Client`](crate::relay::client::Client) record is the sole
/// long-lived owner; clones handed out for delivery are snapshots that
/// become inert once the connection closes.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<OutboundFrame>,
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound channel sender.
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { tx, closed: Arc::new(watch::Sender::new(false)) }
    }

    /// Create a handle together with the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue an envelope for delivery.
    ///
    /// Non-blocking: a full queue drops the frame rather than stalling the
    /// caller, matching the relay's best-effort delivery contract.
    pub fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(OutboundFrame::Envelope(envelope)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Queue a transport-level ping probe.
    pub fn ping(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(OutboundFrame::Ping).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Queue a pong reply carrying the ping's payload.
    pub fn pong(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(OutboundFrame::Pong(payload)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Close the connection. Idempotent.
    ///
    /// The close frame is queued best-effort; even if the queue is full,
    /// the closure itself is still observable through [`closed`] and
    /// [`is_closed`], so the connection's tasks shut down regardless.
    ///
    /// [`closed`]: Self::closed
    /// [`is_closed`]: Self::is_closed
    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            let _ = self.tx.try_send(OutboundFrame::Close);
        }
    }

    /// Whether the connection is closed or its writer task has exited.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    /// Wait until [`close`](Self::close) is called on any clone of this
    /// handle. Resolves immediately if the connection is already closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
