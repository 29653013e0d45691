//! Error types for the crypto module.

use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key unwrap failed because the password-derived key did not
    /// authenticate the ciphertext.
    #[error("wrong password")]
    WrongPassword,

    /// An envelope signature did not verify under the sender's public key.
    #[error("bad envelope signature")]
    BadSignature,

    /// An envelope decrypted to garbage or its AEAD tag did not verify.
    #[error("envelope ciphertext tampered")]
    Tampered,

    /// An envelope timestamp is outside the accepted freshness window.
    #[error("stale envelope: sent {age_ms} ms ago")]
    StaleEnvelope {
        /// Absolute distance between the envelope timestamp and now.
        age_ms: i64,
    },

    /// A JWK could not be parsed or had the wrong shape for the expected
    /// algorithm.
    #[error("invalid JWK: {0}")]
    InvalidJwk(String),

    /// A key, salt or nonce had the wrong length.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes.
        actual: usize,
    },

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Symmetric or asymmetric encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed for a reason other than authentication
    /// (e.g. the RSA-OAEP unwrap of the symmetric key).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Invalid hex input.
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
