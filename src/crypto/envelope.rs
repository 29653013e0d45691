//! Authenticated message envelopes.
//!
//! Hybrid public-key encryption with a sender signature and a freshness
//! check, used in both directions between a user device and a Gladys
//! instance. A fresh AES-256-GCM key encrypts the payload, that key is
//! RSA-OAEP-wrapped under the recipient's encryption key, and the sender
//! signs `iv || ciphertext || sentAt` with its ECDSA key (encrypt-then-sign,
//! binding the sender identity to the exact ciphertext).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use super::{CryptoError, Result, random_bytes};

/// Maximum accepted distance between an envelope's `sentAt` and the local
/// clock, in milliseconds. Bounds the replay window.
pub const MAX_AGE_MS: i64 = 120_000;

const SYM_KEY_BYTES: usize = 32;
const IV_BYTES: usize = 12;

/// An authenticated ciphertext as it travels through the relay.
///
/// All binary fields are hex-encoded; `sentAt` is client clock milliseconds
/// since epoch. Envelopes are transient and never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// AES-GCM IV.
    pub nonce: String,
    /// AES-GCM ciphertext of the JSON payload.
    pub ciphertext: String,
    /// RSA-OAEP ciphertext of the symmetric key.
    pub wrapped_sym_key: String,
    /// ECDSA P-256 signature (raw `r || s`) over `iv || ciphertext || sentAt`.
    pub signature: String,
    /// Sender clock, milliseconds since epoch.
    pub sent_at: i64,
}

/// Options for [`decrypt`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptOptions {
    /// Skip the freshness check. Only for callers that legitimately decrypt
    /// stored envelopes, such as backup keys.
    pub disable_timestamp_check: bool,
}

fn signing_input(iv: &[u8], ciphertext: &[u8], sent_at: i64) -> Vec<u8> {
    let sent_at = sent_at.to_string();
    let mut input = Vec::with_capacity(iv.len() + ciphertext.len() + sent_at.len());
    input.extend_from_slice(iv);
    input.extend_from_slice(ciphertext);
    input.extend_from_slice(sent_at.as_bytes());
    input
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Encrypt a JSON payload for a recipient, signed by the sender.
///
/// # Arguments
/// * `recipient` - The recipient's RSA-OAEP public key.
/// * `signer` - The sender's ECDSA private key.
/// * `payload` - The JSON payload.
///
/// # Returns
/// The [`Envelope`] ready to emit on the socket.
pub fn encrypt(recipient: &RsaPublicKey, signer: &SigningKey, payload: &Value) -> Result<Envelope> {
    encrypt_at(recipient, signer, payload, now_ms())
}

pub(crate) fn encrypt_at(
    recipient: &RsaPublicKey,
    signer: &SigningKey,
    payload: &Value,
    sent_at: i64,
) -> Result<Envelope> {
    let payload_bytes = serde_json::to_vec(payload)?;
    let sym_key = random_bytes(SYM_KEY_BYTES);
    let iv = random_bytes(IV_BYTES);

    let cipher = Aes256Gcm::new_from_slice(&sym_key).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), payload_bytes.as_ref())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let wrapped_sym_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &sym_key)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let signature: Signature = signer.sign(&signing_input(&iv, &ciphertext, sent_at));

    Ok(Envelope {
        nonce: hex::encode(&iv),
        ciphertext: hex::encode(&ciphertext),
        wrapped_sym_key: hex::encode(&wrapped_sym_key),
        signature: hex::encode(signature.to_bytes()),
        sent_at,
    })
}

/// Verify and decrypt an envelope.
///
/// Verification order: sender signature first, then freshness, then key
/// unwrap, then AEAD. A payload is only ever returned when every step
/// passed.
///
/// # Arguments
/// * `self_private` - Our RSA-OAEP private key.
/// * `sender` - The sender's ECDSA public key.
/// * `envelope` - The inbound envelope.
/// * `options` - See [`DecryptOptions`].
///
/// # Errors
/// [`CryptoError::BadSignature`], [`CryptoError::StaleEnvelope`] or
/// [`CryptoError::Tampered`] depending on which check failed.
pub fn decrypt(
    self_private: &RsaPrivateKey,
    sender: &VerifyingKey,
    envelope: &Envelope,
    options: DecryptOptions,
) -> Result<Value> {
    let iv = hex::decode(&envelope.nonce)?;
    let ciphertext = hex::decode(&envelope.ciphertext)?;
    let wrapped_sym_key = hex::decode(&envelope.wrapped_sym_key)?;
    let signature_bytes = hex::decode(&envelope.signature)?;

    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| CryptoError::BadSignature)?;
    sender
        .verify(&signing_input(&iv, &ciphertext, envelope.sent_at), &signature)
        .map_err(|_| CryptoError::BadSignature)?;

    if !options.disable_timestamp_check {
        let age_ms = (now_ms() - envelope.sent_at).abs();
        if age_ms > MAX_AGE_MS {
            return Err(CryptoError::StaleEnvelope { age_ms });
        }
    }

    let sym_key = self_private
        .decrypt(Oaep::new::<Sha256>(), &wrapped_sym_key)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let cipher = Aes256Gcm::new_from_slice(&sym_key).map_err(|_| CryptoError::DecryptionFailed)?;
    let payload_bytes = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::Tampered)?;

    Ok(serde_json::from_slice(&payload_bytes)?)
}
