//! SRP (Secure Remote Password) client.
//!
//! Wraps the SRP protocol for password-based authentication against the
//! relay without ever transmitting the password. The SRP secret is not the
//! raw password but a PBKDF2 derivation of `email:password` under the
//! account's SRP salt, so the verifier stored on the relay is useless
//! without both the password and the salt.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use srp::client::{SrpClient as SrpClientInner, SrpClientVerifier};
use srp::groups::G_2048;

use super::{AuthError, Result};

/// PBKDF2 iteration count for the SRP private key.
pub const SRP_PBKDF2_ITERATIONS: u32 = 100_000;

/// SRP private key length in bytes.
pub const SRP_PRIVATE_KEY_BYTES: usize = 32;

/// Derive the ephemeral SRP private key from normalized credentials.
///
/// `srp_private_key = PBKDF2-HMAC-SHA-256("email:password", srp_salt)`.
/// The result is never stored anywhere; both signup (verifier derivation)
/// and login (proof computation) re-derive it on demand.
///
/// # Arguments
/// * `email` - Normalized email (trimmed, lowercased).
/// * `password` - Normalized password (trimmed).
/// * `srp_salt` - The account's SRP salt (raw bytes).
pub fn derive_srp_private_key(email: &str, password: &str, srp_salt: &[u8]) -> Vec<u8> {
    let identity = format!("{email}:{password}");
    let mut key = vec![0u8; SRP_PRIVATE_KEY_BYTES];
    pbkdf2_hmac::<Sha256>(
        identity.as_bytes(),
        srp_salt,
        SRP_PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

/// Derive the SRP verifier for signup.
///
/// The relay persists `(srp_salt, verifier)`; knowledge of the verifier does
/// not allow impersonating the client.
///
/// # Returns
/// The verifier bytes (caller hex-encodes for the API).
pub fn derive_verifier(email: &str, srp_private_key: &[u8], srp_salt: &[u8]) -> Vec<u8> {
    let client = SrpClientInner::<Sha256>::new(&G_2048);
    client.compute_verifier(email.as_bytes(), srp_private_key, srp_salt)
}

/// SRP client for one login attempt.
///
/// Usage:
/// 1. Create with `new()`
/// 2. Send the public ephemeral from `compute_a()` to the relay
/// 3. Feed the relay's public ephemeral to `set_b()`
/// 4. Send the proof from `compute_m1()`
/// 5. Verify the relay's proof with `verify_m2()` before trusting anything
///    else in the response
pub struct SrpAuthClient {
    inner: SrpClientInner<'static, Sha256>,
    identity: Vec<u8>,
    srp_private_key: Vec<u8>,
    salt: Vec<u8>,
    a_private: Vec<u8>,
    a_public: Vec<u8>,
    verifier: Option<SrpClientVerifier<Sha256>>,
}

impl SrpAuthClient {
    /// Create a new SRP client.
    ///
    /// # Arguments
    /// * `email` - Normalized email, used as the SRP identity.
    /// * `srp_salt` - The account's SRP salt (raw bytes).
    /// * `srp_private_key` - Output of [`derive_srp_private_key`].
    pub fn new(email: &str, srp_salt: &[u8], srp_private_key: &[u8]) -> Result<Self> {
        let client = SrpClientInner::<Sha256>::new(&G_2048);

        let mut a_private = vec![0u8; 64];
        getrandom::getrandom(&mut a_private)
            .map_err(|e| AuthError::Srp(format!("failed to generate ephemeral: {e}")))?;

        let a_public = client.compute_public_ephemeral(&a_private);

        Ok(Self {
            inner: client,
            identity: email.as_bytes().to_vec(),
            srp_private_key: srp_private_key.to_vec(),
            salt: srp_salt.to_vec(),
            a_private,
            a_public,
            verifier: None,
        })
    }

    /// The client's public ephemeral value A, to send to the relay.
    pub fn compute_a(&self) -> Vec<u8> {
        self.a_public.clone()
    }

    /// Process the relay's public ephemeral value B.
    ///
    /// Computes the shared session and prepares the client proof.
    pub fn set_b(&mut self, server_b: &[u8]) -> Result<()> {
        let verifier = self
            .inner
            .process_reply(
                &self.a_private,
                &self.identity,
                &self.srp_private_key,
                &self.salt,
                server_b,
            )
            .map_err(|e| AuthError::Srp(format!("failed to process server ephemeral: {e}")))?;

        self.verifier = Some(verifier);
        Ok(())
    }

    /// The client proof M1, to send to the relay.
    pub fn compute_m1(&self) -> Result<Vec<u8>> {
        Ok(self
            .verifier
            .as_ref()
            .ok_or(AuthError::MissingStep("set_b"))?
            .proof()
            .to_vec())
    }

    /// Verify the relay's proof M2.
    ///
    /// # Errors
    /// [`AuthError::ServerImpersonation`] when the proof does not match,
    /// meaning the relay never knew the verifier for this account.
    pub fn verify_m2(&self, server_m2: &[u8]) -> Result<()> {
        self.verifier
            .as_ref()
            .ok_or(AuthError::MissingStep("set_b"))?
            .verify_server(server_m2)
            .map_err(|_| AuthError::ServerImpersonation)
    }
}
