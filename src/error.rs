//! Crate-level error type.

use thiserror::Error;

use crate::auth::AuthError;
use crate::crypto::CryptoError;
use crate::session::TransportError;

/// Errors surfaced by the gateway client.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic failure (wrap/unwrap, envelope validation).
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Authentication failure (SRP, two-factor).
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The relay answered an HTTP call with a non-success status.
    #[error("api error: status {status}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, JSON when the relay sent JSON.
        body: serde_json::Value,
    },

    /// The refresh token was rejected; the session cannot continue.
    #[error("refresh token rejected")]
    AuthExpired,

    /// The relay refused the socket authentication frame.
    #[error("socket authentication rejected")]
    AuthRejected,

    /// Operation attempted after `disconnect()` or before connect resolved.
    #[error("session closed")]
    SessionClosed,

    /// No primary instance exists on this account.
    #[error("no primary instance")]
    NoInstance,

    /// The instance id is unknown (session connected before instance fetch).
    #[error("no instance id")]
    NoInstanceId,

    /// A peer id could not be resolved even after a directory refresh.
    #[error("unknown sender: {0}")]
    UnknownSender(String),

    /// A recipient id could not be resolved even after a directory refresh.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// An E2EE API call came back with `status >= 400`; the decrypted
    /// payload is carried as-is.
    #[error("request failed")]
    RequestFailed(serde_json::Value),
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
