//! Transport seam between the session and the relay socket.
//!
//! The session only ever sees this trait: a connected event stream plus
//! emit / emit-with-ack. The production implementation is the websocket
//! transport in [`super::ws`]; tests drive the session with an in-memory
//! implementation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors produced by the socket transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The initial connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An emit was attempted while the socket is down; the transport is
    /// still reconnecting, so the caller may retry.
    #[error("not connected")]
    NotConnected,

    /// The transport was closed for good with `close()`.
    #[error("transport closed")]
    Closed,

    /// The websocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Continuation for answering an inbound frame that requested an ack.
///
/// Dropping the handle without responding drops the ack; the emitter's
/// `emit_with_ack` then fails on its side, which is the correct signal for
/// "the peer did not answer".
#[derive(Debug)]
pub struct AckHandle {
    tx: Option<oneshot::Sender<Value>>,
}

impl AckHandle {
    /// Create a handle and the receiving half the transport forwards from.
    pub fn new() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Send the ack payload back to the emitter.
    pub fn respond(mut self, payload: Value) {
        if let Some(tx) = self.tx.take() {
            // The emitter may have given up; nothing to do then.
            let _ = tx.send(payload);
        }
    }
}

/// Events surfaced by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is up. Emitted after every successful connect, including
    /// reconnects; the session re-authenticates on each one.
    Connected,

    /// An inbound frame.
    Frame {
        /// Event name (`message`, `hello`, ...).
        event: String,
        /// Frame payload.
        data: Value,
        /// Present when the emitter asked for an ack.
        ack: Option<AckHandle>,
    },

    /// The socket went down. The transport keeps reconnecting on its own
    /// unless it was closed.
    Disconnected {
        /// Human-readable reason (`io server disconnect` for a
        /// server-initiated kick).
        reason: String,
    },
}

/// A bidirectional socket to the relay.
///
/// Implementations own reconnection; pending acks MUST survive a reconnect
/// and only reject when the transport is closed for good.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Start connecting and return the event stream.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Fire-and-forget emit.
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError>;

    /// Emit and wait for the peer's ack payload.
    async fn emit_with_ack(&self, event: &str, data: Value) -> Result<Value, TransportError>;

    /// Reconnect immediately (used after a server-initiated disconnect,
    /// which suppresses the built-in retry of some transports).
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Close for good. Pending acks reject with [`TransportError::Closed`].
    async fn close(&self);
}
