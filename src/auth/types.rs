//! Authentication error types.

use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors produced by the authentication flows.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The server's SRP session proof did not verify. Either the relay does
    /// not know the verifier it claims to, or someone is in the middle.
    /// Fatal; no tokens are exposed.
    #[error("server session proof verification failed")]
    ServerImpersonation,

    /// Login needs a TOTP code before tokens are released.
    #[error("two-factor code required")]
    TwoFactorRequired {
        /// Opaque challenge token to present with the TOTP code.
        two_factor_token: String,
    },

    /// SRP arithmetic failure (malformed server ephemeral, RNG failure).
    #[error("srp error: {0}")]
    Srp(String),

    /// An SRP client method was called out of order.
    #[error("srp protocol misuse: {0} must be called first")]
    MissingStep(&'static str),

    /// The login response was missing a field it must carry at that step.
    #[error("malformed login response: missing {0}")]
    MalformedResponse(&'static str),

    /// Key unwrap or other crypto failure during login.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
