//! Client core for the Gladys Plus gateway.
//!
//! The gateway brokers end-to-end-encrypted messaging between user devices
//! and a Gladys instance running behind a NAT, through an untrusted relay.
//! The relay sees ciphertext, routing identifiers and connectivity state;
//! it can neither read message contents nor impersonate endpoints.
//!
//! The crate provides:
//! - [`crypto`]: password-derived key wrapping, hybrid message envelopes,
//!   JWK import/export and keypair generation
//! - [`auth`]: SRP login with mandatory server verification, two-factor
//!   completion and signup material generation
//! - [`api`]: the relay HTTP client with transparent token refresh
//! - [`session`]: the socket session, peer key directory and the
//!   API-over-E2EE request router
//!
//! ## Connecting a user device
//!
//! ```ignore
//! let api = ApiClient::new("https://api.gladysgateway.com", Role::User)?;
//! let login = auth::login(&api, email, password).await?;
//!
//! let transport = Arc::new(WsTransport::new("wss://api.gladysgateway.com/socket"));
//! let keys = SessionKeys::from(&login.keys);
//! let (session, mut events) = SocketSession::connect(api, keys, transport).await?;
//!
//! let devices = session.send_request_get("/devices", None).await?;
//! while let Some(event) = events.recv().await {
//!     // GatewayEvent::Message { payload, .. } carries decrypted payloads.
//! }
//! ```

pub mod api;
pub mod auth;
pub mod crypto;
mod error;
pub mod session;

pub use error::{Error, Result};
