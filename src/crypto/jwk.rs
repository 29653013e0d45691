//! JWK (JSON Web Key) import and export.
//!
//! The relay and the browser clients exchange keys as WebCrypto JWK strings,
//! so the exact JSON shape matters on the wire. Public key fields received
//! from the relay are JSON strings holding a JWK (double-encoded); this
//! module validates them at the boundary and hands parsed keys to the rest
//! of the crate.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use super::{CryptoError, Result};

/// JWK shape for RSA keys (RSASSA/RSAES parameter names from RFC 7518).
///
/// Private fields are optional so the same type round-trips both public and
/// private keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaJwk {
    /// Key type, always `"RSA"`.
    pub kty: String,
    /// Algorithm hint, `"RSA-OAEP-256"` for the gateway's encryption keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Modulus, base64url.
    pub n: String,
    /// Public exponent, base64url.
    pub e: String,
    /// Private exponent, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// First prime factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    /// Second prime factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// d mod (p - 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    /// d mod (q - 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    /// CRT coefficient, q^-1 mod p.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
    /// WebCrypto key operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    /// WebCrypto extractability flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
}

fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn uint_to_b64url(value: &BigUint) -> String {
    b64url(&value.to_bytes_be())
}

fn b64url_to_uint(field: &'static str, value: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| CryptoError::InvalidJwk(format!("field {field}: {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn require<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| CryptoError::InvalidJwk(format!("missing private field {field}")))
}

/// Export an RSA private key as a WebCrypto-compatible JWK string.
///
/// The CRT parameters (`dp`, `dq`, `qi`) are included because WebCrypto's
/// importer requires them.
pub fn rsa_private_to_jwk(key: &RsaPrivateKey) -> Result<String> {
    let primes = key.primes();
    if primes.len() != 2 {
        return Err(CryptoError::InvalidJwk(format!(
            "expected 2 primes, got {}",
            primes.len()
        )));
    }
    let p = &primes[0];
    let q = &primes[1];
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);
    let dp = key.d() % &(p - &one);
    let dq = key.d() % &(q - &one);
    // p is prime, so q^-1 mod p = q^(p-2) mod p by Fermat's little theorem.
    let qi = q.modpow(&(p - &two), p);

    let jwk = RsaJwk {
        kty: "RSA".to_string(),
        alg: Some("RSA-OAEP-256".to_string()),
        n: uint_to_b64url(key.n()),
        e: uint_to_b64url(key.e()),
        d: Some(uint_to_b64url(key.d())),
        p: Some(uint_to_b64url(p)),
        q: Some(uint_to_b64url(q)),
        dp: Some(uint_to_b64url(&dp)),
        dq: Some(uint_to_b64url(&dq)),
        qi: Some(uint_to_b64url(&qi)),
        key_ops: Some(vec!["decrypt".to_string()]),
        ext: Some(true),
    };
    Ok(serde_json::to_string(&jwk)?)
}

/// Export an RSA public key as a WebCrypto-compatible JWK string.
pub fn rsa_public_to_jwk(key: &RsaPublicKey) -> Result<String> {
    let jwk = RsaJwk {
        kty: "RSA".to_string(),
        alg: Some("RSA-OAEP-256".to_string()),
        n: uint_to_b64url(key.n()),
        e: uint_to_b64url(key.e()),
        d: None,
        p: None,
        q: None,
        dp: None,
        dq: None,
        qi: None,
        key_ops: Some(vec!["encrypt".to_string()]),
        ext: Some(true),
    };
    Ok(serde_json::to_string(&jwk)?)
}

/// Import an RSA private key from a JWK string.
pub fn rsa_private_from_jwk(raw: &str) -> Result<RsaPrivateKey> {
    let jwk: RsaJwk = serde_json::from_str(raw)?;
    if jwk.kty != "RSA" {
        return Err(CryptoError::InvalidJwk(format!(
            "expected kty RSA, got {}",
            jwk.kty
        )));
    }
    let n = b64url_to_uint("n", &jwk.n)?;
    let e = b64url_to_uint("e", &jwk.e)?;
    let d = b64url_to_uint("d", require("d", &jwk.d)?)?;
    let p = b64url_to_uint("p", require("p", &jwk.p)?)?;
    let q = b64url_to_uint("q", require("q", &jwk.q)?)?;

    RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| CryptoError::InvalidJwk(format!("invalid RSA components: {e}")))
}

/// Import an RSA public key from a JWK string.
pub fn rsa_public_from_jwk(raw: &str) -> Result<RsaPublicKey> {
    let jwk: RsaJwk = serde_json::from_str(raw)?;
    if jwk.kty != "RSA" {
        return Err(CryptoError::InvalidJwk(format!(
            "expected kty RSA, got {}",
            jwk.kty
        )));
    }
    let n = b64url_to_uint("n", &jwk.n)?;
    let e = b64url_to_uint("e", &jwk.e)?;
    RsaPublicKey::new(n, e).map_err(|e| CryptoError::InvalidJwk(format!("invalid RSA key: {e}")))
}

/// Export a P-256 private key as a JWK string.
pub fn ec_private_to_jwk(key: &p256::SecretKey) -> String {
    key.to_jwk_string().to_string()
}

/// Export a P-256 public key as a JWK string.
pub fn ec_public_to_jwk(key: &p256::PublicKey) -> String {
    key.to_jwk_string()
}

/// Import a P-256 private key from a JWK string.
pub fn ec_private_from_jwk(raw: &str) -> Result<p256::SecretKey> {
    p256::SecretKey::from_jwk_str(raw)
        .map_err(|e| CryptoError::InvalidJwk(format!("invalid EC private key: {e}")))
}

/// Import a P-256 public key from a JWK string.
pub fn ec_public_from_jwk(raw: &str) -> Result<p256::PublicKey> {
    p256::PublicKey::from_jwk_str(raw)
        .map_err(|e| CryptoError::InvalidJwk(format!("invalid EC public key: {e}")))
}
