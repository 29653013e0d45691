//! Key generation and identity fingerprints.
//!
//! Every principal (user device or Gladys instance) owns two long-term
//! keypairs generated together: an RSA-OAEP encryption keypair and an
//! ECDSA P-256 signing keypair.

use rand::rngs::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::{CryptoError, Result};

/// RSA modulus size for encryption keys.
pub const RSA_MODULUS_BITS: usize = 2048;

/// Which asymmetric algorithm a wrapped private key holds.
///
/// The relay stores both wrapped keys side by side; the caller states which
/// one it is unwrapping so the importer picks the right JWK shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA-OAEP-SHA-256 encryption key.
    Rsa,
    /// ECDSA P-256 signing key.
    Ecdsa,
}

/// The two keypairs owned by a principal.
#[derive(Debug, Clone)]
pub struct GeneratedKeys {
    /// RSA private key (decryption).
    pub rsa_private: RsaPrivateKey,
    /// RSA public key (published to peers through the relay).
    pub rsa_public: RsaPublicKey,
    /// ECDSA private key (signing).
    pub ecdsa_private: p256::SecretKey,
    /// ECDSA public key (published to peers through the relay).
    pub ecdsa_public: p256::PublicKey,
}

/// Generate a fresh encryption keypair and signing keypair.
///
/// # Returns
/// A [`GeneratedKeys`] bundle; both keypairs share a lifetime and are
/// rotated together.
pub fn generate_keys() -> Result<GeneratedKeys> {
    let rsa_private = RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS)
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
    let rsa_public = rsa_private.to_public_key();

    let ecdsa_private = p256::SecretKey::random(&mut OsRng);
    let ecdsa_public = ecdsa_private.public_key();

    Ok(GeneratedKeys {
        rsa_private,
        rsa_public,
        ecdsa_private,
        ecdsa_public,
    })
}

/// Compute the fingerprint of a key from its raw JWK string.
///
/// Fingerprints are computed over the exact JWK string received from the
/// relay (not a re-serialization) so two devices always agree on them.
///
/// # Returns
/// Lowercase hex SHA-256 of the JWK string.
pub fn fingerprint(raw_jwk: &str) -> String {
    let digest = Sha256::digest(raw_jwk.as_bytes());
    hex::encode(digest)
}
