//! Relay socket session: transport, peer directory, state machine and the
//! request/response router.

mod peers;
mod router;
mod socket;
mod transport;
mod ws;

pub use peers::{PeerDirectory, PeerEntry};
pub use router::Delivery;
pub use socket::{
    EncryptedResponder, GatewayEvent, InstancePeer, PlainResponder, SessionKeys, SessionState,
    SocketSession,
};
pub use transport::{AckHandle, RelayTransport, TransportError, TransportEvent};
pub use ws::WsTransport;
