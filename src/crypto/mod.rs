//! Cryptographic operations used by the gateway client.
//!
//! Pure Rust implementation, compatible with WebCrypto wire formats
//! (JWK key encoding, AES-GCM, RSA-OAEP-SHA-256, ECDSA P-256).

use rand::RngCore;

mod error;
pub mod envelope;
pub mod jwk;
pub mod keys;
pub mod vault;

pub use error::{CryptoError, Result};

/// A heap-allocated byte buffer that is **zeroized on drop**.
///
/// Prefer this type for sensitive key material that should not remain in
/// memory after it goes out of scope.
pub type SecretVec = zeroize::Zeroizing<Vec<u8>>;

/// Fill a vector with cryptographically secure random bytes.
///
/// # Arguments
/// * `len` - Number of random bytes to generate.
///
/// # Returns
/// A vector of `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Decode a hex string to bytes.
///
/// # Arguments
/// * `input` - Hex encoded string.
///
/// # Returns
/// The decoded bytes.
pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(input)?)
}

/// Encode bytes to a hex string (lowercase).
pub fn encode_hex(input: &[u8]) -> String {
    hex::encode(input)
}
