//! Relay socket session.
//!
//! Owns the connection lifecycle: authenticate on every (re)connect, keep
//! the peer directory in sync with relay notifications, and dispatch
//! inbound frames serially to the caller's event channel. Inbound frames
//! that fail decryption are dropped with a warning and never delivered.

use p256::ecdsa::{SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

use super::peers::PeerDirectory;
use super::transport::{AckHandle, RelayTransport, TransportEvent};
use crate::api::{ApiClient, Role};
use crate::auth::DecryptedKeys;
use crate::crypto::envelope::{self, DecryptOptions, Envelope};
use crate::crypto::jwk;
use crate::error::{Error, Result};

/// Reason string the relay uses when it kicks a socket on purpose.
const SERVER_INITIATED_DISCONNECT: &str = "io server disconnect";

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Transport is being established (also between reconnect attempts).
    Connecting,
    /// Transport is up, authentication not started.
    TransportUp,
    /// Authentication frame sent, waiting for the ack.
    Authenticating,
    /// Authenticated; frames flow.
    Ready,
    /// Closed for good by `disconnect()` or a fatal authentication failure.
    Closed,
}

/// The session's own private keys.
pub struct SessionKeys {
    /// RSA-OAEP decryption key.
    pub rsa_private: RsaPrivateKey,
    /// ECDSA signing key.
    pub ecdsa_private: SigningKey,
}

impl From<&DecryptedKeys> for SessionKeys {
    fn from(keys: &DecryptedKeys) -> Self {
        Self {
            rsa_private: keys.rsa_private.clone(),
            ecdsa_private: SigningKey::from(&keys.ecdsa_private),
        }
    }
}

/// The peer instance of a user session.
#[derive(Debug, Clone)]
pub struct InstancePeer {
    /// Relay-assigned instance id.
    pub id: String,
    /// Parsed RSA encryption public key.
    pub rsa_public_key: RsaPublicKey,
    /// Parsed ECDSA verification key.
    pub ecdsa_public_key: VerifyingKey,
    /// Exact RSA JWK string, for fingerprinting.
    pub rsa_public_key_raw: String,
    /// Exact ECDSA JWK string, for fingerprinting.
    pub ecdsa_public_key_raw: String,
}

/// Continuation for answering a decrypted inbound message with an
/// encrypted response.
pub struct EncryptedResponder {
    ack: AckHandle,
    recipient_rsa: RsaPublicKey,
    signer: SigningKey,
}

impl EncryptedResponder {
    /// Encrypt `payload` for the original sender and deliver it as the ack.
    pub fn respond(self, payload: &Value) -> Result<()> {
        let sealed = envelope::encrypt(&self.recipient_rsa, &self.signer, payload)?;
        self.ack.respond(serde_json::to_value(sealed)?);
        Ok(())
    }
}

/// Continuation for answering an `open-api-message` in plaintext (the
/// counter-party is a third party without our keys).
pub struct PlainResponder {
    ack: AckHandle,
}

impl PlainResponder {
    /// Deliver the plaintext ack.
    pub fn respond(self, payload: Value) {
        self.ack.respond(payload);
    }
}

/// Events delivered to the session's caller.
pub enum GatewayEvent {
    /// Authentication completed; the session reached `Ready`. Fires again
    /// after every reconnect.
    Ready,
    /// A decrypted inbound message. Instance sessions get a responder when
    /// the sender asked for an ack.
    Message {
        /// Decrypted payload.
        payload: Value,
        /// Present on instance sessions for sender-addressed replies.
        responder: Option<EncryptedResponder>,
    },
    /// A pass-through frame from a third party, not E2EE.
    OpenApiMessage {
        /// Plaintext payload.
        payload: Value,
        /// Plaintext ack continuation.
        responder: Option<PlainResponder>,
    },
    /// A peer came online.
    Hello {
        /// Frame payload (peer identity).
        data: Value,
    },
    /// The socket dropped; the transport is reconnecting.
    Disconnected {
        /// Transport-provided reason.
        reason: String,
    },
    /// An inbound frame was dropped before delivery. The payload is never
    /// surfaced (it failed validation or its sender is unknown); only the
    /// reason is, so callers can observe the drop.
    FrameDropped {
        /// Why the frame was dropped ([`Error::UnknownSender`] or a
        /// [`crate::crypto::CryptoError`] wrapped in [`Error::Crypto`]).
        error: Error,
    },
}

pub(crate) struct SessionInner {
    pub(crate) role: Role,
    pub(crate) api: ApiClient,
    pub(crate) keys: SessionKeys,
    pub(crate) transport: Arc<dyn RelayTransport>,
    pub(crate) peers: PeerDirectory,
    pub(crate) instance: Mutex<Option<InstancePeer>>,
    pub(crate) state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        log::debug!("session state -> {state:?}");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn instance_peer(&self) -> Option<InstancePeer> {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A connected session to the relay.
///
/// One value per connected client; user sessions have a single peer (the
/// instance), instance sessions have many peer users. All request/response
/// messaging lives on this type (see the router methods).
pub struct SocketSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl SocketSession {
    /// Connect and authenticate against the relay.
    ///
    /// Resolves once the first authentication round-trip completed; later
    /// reconnects re-authenticate in the background and surface as
    /// [`GatewayEvent::Disconnected`] / [`GatewayEvent::Ready`] pairs.
    ///
    /// # Errors
    /// [`Error::AuthExpired`] when the refresh token is rejected and
    /// [`Error::AuthRejected`] when the relay refuses the authentication
    /// frame; both leave the session `Closed`.
    pub async fn connect(
        api: ApiClient,
        keys: SessionKeys,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            role: api.role(),
            api,
            keys,
            transport: Arc::clone(&transport),
            peers: PeerDirectory::new(),
            instance: Mutex::new(None),
            state: Mutex::new(SessionState::Connecting),
            events: events_tx,
        });

        let transport_rx = transport.start().await?;
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(dispatch_loop(Arc::clone(&inner), transport_rx, first_tx));

        first_rx.await.map_err(|_| Error::SessionClosed)??;
        Ok((Self { inner }, events_rx))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The HTTP client this session authenticates with.
    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// The peer directory (instance sessions).
    pub fn peers(&self) -> &PeerDirectory {
        &self.inner.peers
    }

    /// The peer instance (user sessions), once authenticated.
    pub fn instance(&self) -> Option<InstancePeer> {
        self.inner.instance_peer()
    }

    /// Close the session for good.
    ///
    /// The transport stops reconnecting and pending requests reject.
    pub async fn disconnect(&self) {
        self.inner.set_state(SessionState::Closed);
        self.inner.transport.close().await;
    }
}

async fn dispatch_loop(
    inner: Arc<SessionInner>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    first_tx: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first_tx);

    while let Some(event) = transport_rx.recv().await {
        if inner.state() == SessionState::Closed {
            break;
        }
        match event {
            TransportEvent::Connected => {
                inner.set_state(SessionState::TransportUp);
                match authenticate(&inner).await {
                    Ok(()) => {
                        inner.set_state(SessionState::Ready);
                        let _ = inner.events.send(GatewayEvent::Ready);
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        log::error!("session authentication failed: {e}");
                        inner.set_state(SessionState::Closed);
                        inner.transport.close().await;
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Err(e));
                        }
                        break;
                    }
                }
            }
            TransportEvent::Frame { event, data, ack } => {
                if inner.state() != SessionState::Ready {
                    log::warn!("dropping {event} frame outside Ready");
                    continue;
                }
                handle_frame(&inner, &event, data, ack).await;
            }
            TransportEvent::Disconnected { reason } => {
                inner.set_state(SessionState::Connecting);
                let _ = inner.events.send(GatewayEvent::Disconnected {
                    reason: reason.clone(),
                });
                if reason == SERVER_INITIATED_DISCONNECT {
                    // The relay kicked us on purpose; built-in retry is
                    // suppressed for this case, so reconnect explicitly.
                    if let Err(e) = inner.transport.reconnect().await {
                        log::warn!("explicit reconnect failed: {e}");
                    }
                }
            }
        }
    }
}

/// Authenticate a fresh transport connection.
///
/// Refresh the access token, prime the peer keys for the session's role,
/// then present the token on the socket.
async fn authenticate(inner: &SessionInner) -> Result<()> {
    let access_token = inner.api.refresh_access_token().await?;

    match inner.role {
        Role::User => {
            let dto = inner.api.primary_instance().await?;
            let peer = InstancePeer {
                id: dto.id,
                rsa_public_key: jwk::rsa_public_from_jwk(&dto.rsa_public_key)?,
                ecdsa_public_key: VerifyingKey::from(&jwk::ec_public_from_jwk(
                    &dto.ecdsa_public_key,
                )?),
                rsa_public_key_raw: dto.rsa_public_key,
                ecdsa_public_key_raw: dto.ecdsa_public_key,
            };
            *inner
                .instance
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(peer);
        }
        Role::Instance => {
            inner.peers.refresh(&inner.api).await?;
        }
    }

    inner.set_state(SessionState::Authenticating);
    let event = match inner.role {
        Role::User => "user-authentication",
        Role::Instance => "instance-authentication",
    };
    let ack = inner
        .transport
        .emit_with_ack(event, json!({ "access_token": access_token }))
        .await?;

    if ack.get("authenticated").and_then(Value::as_bool) == Some(true) {
        Ok(())
    } else {
        Err(Error::AuthRejected)
    }
}

async fn handle_frame(inner: &Arc<SessionInner>, event: &str, data: Value, ack: Option<AckHandle>) {
    match event {
        "message" => handle_message(inner, data, ack).await,
        "open-api-message" => {
            let _ = inner.events.send(GatewayEvent::OpenApiMessage {
                payload: data,
                responder: ack.map(|ack| PlainResponder { ack }),
            });
        }
        "hello" => {
            let _ = inner.events.send(GatewayEvent::Hello { data });
        }
        "clear-key-cache" => {
            inner.peers.clear().await;
            if let Err(e) = inner.peers.refresh(&inner.api).await {
                log::warn!("key-cache refresh failed: {e}");
            }
        }
        "clear-connected-users-list" => {
            if let Err(e) = inner.peers.refresh(&inner.api).await {
                log::warn!("presence refresh failed: {e}");
            }
        }
        other => log::debug!("ignoring unknown event {other}"),
    }
}

/// Log a dropped frame and surface the typed reason to the caller.
///
/// The payload itself is never delivered; only the drop reason is.
fn drop_frame(inner: &SessionInner, error: Error) {
    log::warn!("dropping inbound frame: {error}");
    let _ = inner.events.send(GatewayEvent::FrameDropped { error });
}

async fn handle_message(inner: &Arc<SessionInner>, data: Value, ack: Option<AckHandle>) {
    let Some(encrypted) = data.get("encryptedMessage") else {
        log::warn!("dropping message frame without encryptedMessage");
        return;
    };
    let sealed: Envelope = match serde_json::from_value(encrypted.clone()) {
        Ok(sealed) => sealed,
        Err(e) => {
            log::warn!("dropping malformed envelope: {e}");
            return;
        }
    };

    match inner.role {
        Role::User => {
            // The only legitimate sender is our instance.
            let Some(instance) = inner.instance_peer() else {
                log::warn!("dropping message before instance keys are known");
                return;
            };
            match envelope::decrypt(
                &inner.keys.rsa_private,
                &instance.ecdsa_public_key,
                &sealed,
                DecryptOptions::default(),
            ) {
                Ok(payload) => {
                    let _ = inner.events.send(GatewayEvent::Message {
                        payload,
                        responder: None,
                    });
                }
                Err(e) => drop_frame(inner, Error::Crypto(e)),
            }
        }
        Role::Instance => {
            let Some(sender_id) = data.get("sender_id").and_then(Value::as_str) else {
                log::warn!("dropping message frame without sender_id");
                return;
            };
            let peer = match inner.peers.get_or_refresh(&inner.api, sender_id).await {
                Ok(Some(peer)) => peer,
                Ok(None) => {
                    drop_frame(inner, Error::UnknownSender(sender_id.to_string()));
                    return;
                }
                Err(e) => {
                    log::warn!("peer lookup for {sender_id} failed: {e}");
                    return;
                }
            };
            match envelope::decrypt(
                &inner.keys.rsa_private,
                &peer.ecdsa_public_key,
                &sealed,
                DecryptOptions::default(),
            ) {
                Ok(payload) => {
                    let responder = ack.map(|ack| EncryptedResponder {
                        ack,
                        recipient_rsa: peer.rsa_public_key.clone(),
                        signer: inner.keys.ecdsa_private.clone(),
                    });
                    let _ = inner.events.send(GatewayEvent::Message { payload, responder });
                }
                Err(e) => drop_frame(inner, Error::Crypto(e)),
            }
        }
    }
}
