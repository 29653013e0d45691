//! Password-derived key wrapping (the key vault).
//!
//! Private keys are stored on the relay as AES-GCM ciphertext of their JWK
//! encoding, under a key derived from the user password with PBKDF2. The
//! relay only ever sees `{wrappedKey, salt, iv}`; the key-encryption key
//! never leaves the client.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::keys::KeyAlgorithm;
use super::{CryptoError, Result, SecretVec, jwk, random_bytes};

/// PBKDF2 iteration count for the key-encryption key.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_BYTES: usize = 16;

/// AES-GCM IV length in bytes.
pub const IV_BYTES: usize = 12;

/// Derived key length in bytes (AES-256).
pub const KEK_BYTES: usize = 32;

/// A private key wrapped under a password-derived key, as persisted on the
/// relay. All fields are hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// AES-GCM ciphertext of the JWK-encoded private key.
    pub wrapped_key: String,
    /// PBKDF2 salt.
    pub salt: String,
    /// AES-GCM IV.
    pub iv: String,
}

/// A private key held in memory, tagged by algorithm.
#[derive(Debug, Clone)]
pub enum PrivateKeyMaterial {
    /// RSA-OAEP decryption key.
    Rsa(rsa::RsaPrivateKey),
    /// ECDSA P-256 signing key.
    Ecdsa(p256::SecretKey),
}

impl PrivateKeyMaterial {
    /// The algorithm this key belongs to.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PrivateKeyMaterial::Rsa(_) => KeyAlgorithm::Rsa,
            PrivateKeyMaterial::Ecdsa(_) => KeyAlgorithm::Ecdsa,
        }
    }

    /// Serialize to a JWK string.
    pub fn to_jwk(&self) -> Result<String> {
        match self {
            PrivateKeyMaterial::Rsa(key) => jwk::rsa_private_to_jwk(key),
            PrivateKeyMaterial::Ecdsa(key) => Ok(jwk::ec_private_to_jwk(key)),
        }
    }

    /// Parse from a JWK string, interpreting it per `alg`.
    pub fn from_jwk(raw: &str, alg: KeyAlgorithm) -> Result<Self> {
        match alg {
            KeyAlgorithm::Rsa => Ok(PrivateKeyMaterial::Rsa(jwk::rsa_private_from_jwk(raw)?)),
            KeyAlgorithm::Ecdsa => Ok(PrivateKeyMaterial::Ecdsa(jwk::ec_private_from_jwk(raw)?)),
        }
    }

    /// Unwrap as an RSA key.
    pub fn into_rsa(self) -> Result<rsa::RsaPrivateKey> {
        match self {
            PrivateKeyMaterial::Rsa(key) => Ok(key),
            PrivateKeyMaterial::Ecdsa(_) => Err(CryptoError::InvalidJwk(
                "expected an RSA key, got an EC key".to_string(),
            )),
        }
    }

    /// Unwrap as an ECDSA key.
    pub fn into_ecdsa(self) -> Result<p256::SecretKey> {
        match self {
            PrivateKeyMaterial::Ecdsa(key) => Ok(key),
            PrivateKeyMaterial::Rsa(_) => Err(CryptoError::InvalidJwk(
                "expected an EC key, got an RSA key".to_string(),
            )),
        }
    }
}

/// Derive the key-encryption key from a password and salt.
///
/// # Arguments
/// * `password` - The user password (already normalized by the caller).
/// * `salt` - 16-byte salt.
///
/// # Returns
/// A 32-byte key, zeroized on drop.
pub fn derive_kek(password: &str, salt: &[u8]) -> SecretVec {
    let mut kek = vec![0u8; KEK_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut kek);
    SecretVec::new(kek)
}

/// Wrap a private key under a password.
///
/// A fresh salt and IV are generated per wrap; wrapped keys are replaced
/// atomically on password change, never mutated in place.
///
/// # Arguments
/// * `password` - The user password.
/// * `key` - The private key to wrap.
///
/// # Returns
/// The hex-encoded [`WrappedKey`] triple to persist on the relay.
pub fn wrap(password: &str, key: &PrivateKeyMaterial) -> Result<WrappedKey> {
    let jwk_bytes = key.to_jwk()?;
    let salt = random_bytes(SALT_BYTES);
    let iv = random_bytes(IV_BYTES);
    let kek = derive_kek(password, &salt);

    let cipher =
        Aes256Gcm::new_from_slice(&kek).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), jwk_bytes.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(WrappedKey {
        wrapped_key: hex::encode(ciphertext),
        salt: hex::encode(salt),
        iv: hex::encode(iv),
    })
}

/// Unwrap a private key with a password.
///
/// # Arguments
/// * `password` - The user password.
/// * `wrapped` - The `{wrappedKey, salt, iv}` triple from the relay.
/// * `alg` - Which algorithm the wrapped JWK holds.
///
/// # Errors
/// [`CryptoError::WrongPassword`] when the GCM authentication tag does not
/// verify, which is the only observable difference between a wrong password
/// and a corrupted blob.
pub fn unwrap(password: &str, wrapped: &WrappedKey, alg: KeyAlgorithm) -> Result<PrivateKeyMaterial> {
    let ciphertext = hex::decode(&wrapped.wrapped_key)?;
    let salt = hex::decode(&wrapped.salt)?;
    let iv = hex::decode(&wrapped.iv)?;
    if iv.len() != IV_BYTES {
        return Err(CryptoError::InvalidLength {
            expected: IV_BYTES,
            actual: iv.len(),
        });
    }

    let kek = derive_kek(password, &salt);
    let cipher =
        Aes256Gcm::new_from_slice(&kek).map_err(|_| CryptoError::DecryptionFailed)?;
    let jwk_bytes = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::WrongPassword)?;

    let raw = String::from_utf8(jwk_bytes)
        .map_err(|_| CryptoError::InvalidJwk("wrapped key is not UTF-8".to_string()))?;
    PrivateKeyMaterial::from_jwk(&raw, alg)
}
