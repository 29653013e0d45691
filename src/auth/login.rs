//! Login and signup flows.
//!
//! Drives the three-round SRP exchange against the relay, verifies the
//! server proof before trusting anything else in the response, and unwraps
//! the password-protected private keys carried by the final grant.

use serde_json::{Value, json};

use super::srp::{self, SrpAuthClient};
use super::types::AuthError;
use crate::api::ApiClient;
use crate::api::models::{AccessGrant, SignupRequest};
use crate::crypto::keys::{self, GeneratedKeys, KeyAlgorithm};
use crate::crypto::vault::{self, PrivateKeyMaterial};
use crate::crypto::{decode_hex, encode_hex, jwk, random_bytes};
use crate::error::Result;

/// Normalize an email for both signup and login.
///
/// Normalization MUST match on both paths, otherwise the SRP private key
/// differs and login deterministically fails.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Normalize a password for both signup and login.
pub fn normalize_password(password: &str) -> String {
    password.trim().to_string()
}

/// Both decrypted private keys of the logged-in principal.
pub struct DecryptedKeys {
    /// RSA-OAEP decryption key.
    pub rsa_private: rsa::RsaPrivateKey,
    /// ECDSA P-256 signing key.
    pub ecdsa_private: p256::SecretKey,
}

/// Everything a device needs after a completed login.
pub struct LoginResult {
    /// Bearer token for HTTP and socket authentication.
    pub access_token: String,
    /// Token used to mint fresh access tokens.
    pub refresh_token: String,
    /// Relay-assigned device id.
    pub device_id: Option<String>,
    /// Own RSA public key, raw JWK string as stored on the relay.
    pub rsa_public_key: String,
    /// Own ECDSA public key, raw JWK string as stored on the relay.
    pub ecdsa_public_key: String,
    /// Decrypted private keys.
    pub keys: DecryptedKeys,
    /// JSON `{rsaPrivateKey, ecdsaPrivateKey}` for caller-chosen storage;
    /// the core never persists it.
    pub serialized_keys: String,
}

/// Key material generated for a new account.
pub struct SignupMaterial {
    /// The request body for `POST /users/signup` or
    /// `POST /invitations/accept`.
    pub request: SignupRequest,
    /// The freshly generated keypairs, for immediate use without a re-login.
    pub keys: GeneratedKeys,
}

/// Generate the cryptographic material for a new account.
///
/// Creates both keypairs, wraps the private halves under the password, and
/// derives the SRP salt and verifier. The relay ends up holding only
/// ciphertext, public JWKs and the verifier.
pub fn generate_signup_material(
    name: Option<&str>,
    email: &str,
    password: &str,
) -> Result<SignupMaterial> {
    let email = normalize_email(email);
    let password = normalize_password(password);

    let generated = keys::generate_keys()?;
    let rsa_encrypted_private_key = vault::wrap(
        &password,
        &PrivateKeyMaterial::Rsa(generated.rsa_private.clone()),
    )?;
    let ecdsa_encrypted_private_key = vault::wrap(
        &password,
        &PrivateKeyMaterial::Ecdsa(generated.ecdsa_private.clone()),
    )?;

    let srp_salt = random_bytes(16);
    let srp_private_key = srp::derive_srp_private_key(&email, &password, &srp_salt);
    let srp_verifier = srp::derive_verifier(&email, &srp_private_key, &srp_salt);

    let request = SignupRequest {
        name: name.map(str::to_string),
        email,
        language: None,
        token: None,
        srp_salt: encode_hex(&srp_salt),
        srp_verifier: encode_hex(&srp_verifier),
        rsa_public_key: jwk::rsa_public_to_jwk(&generated.rsa_public)?,
        rsa_encrypted_private_key,
        ecdsa_public_key: jwk::ec_public_to_jwk(&generated.ecdsa_public),
        ecdsa_encrypted_private_key,
    };

    Ok(SignupMaterial {
        request,
        keys: generated,
    })
}

/// Run the full SRP login flow.
///
/// # Errors
/// * [`AuthError::ServerImpersonation`] when the server proof does not
///   verify; no tokens are exposed in that case.
/// * [`AuthError::TwoFactorRequired`] when the account has TOTP enabled;
///   the carried token goes to [`login_two_factor`] together with the code.
/// * [`crate::crypto::CryptoError::WrongPassword`] when the SRP exchange
///   succeeded but key unwrap failed (the relay holds inconsistent state).
pub async fn login(api: &ApiClient, email: &str, password: &str) -> Result<LoginResult> {
    let email = normalize_email(email);
    let password = normalize_password(password);

    let salt_response = api.login_salt(&email).await?;
    let srp_salt = decode_hex(&salt_response.srp_salt)?;
    let srp_private_key = srp::derive_srp_private_key(&email, &password, &srp_salt);

    let mut srp_client = SrpAuthClient::new(&email, &srp_salt, &srp_private_key)?;

    let ephemeral = api
        .login_generate_ephemeral(&email, &encode_hex(&srp_client.compute_a()))
        .await?;
    srp_client.set_b(&decode_hex(&ephemeral.server_ephemeral_public)?)?;

    let proof = srp_client.compute_m1()?;
    let finalize = api
        .login_finalize(&ephemeral.login_session_key, &encode_hex(&proof))
        .await?;

    // Authenticate the server before touching anything else it sent.
    let server_proof = finalize
        .server_session_proof
        .as_deref()
        .ok_or(AuthError::MalformedResponse("server_session_proof"))?;
    srp_client.verify_m2(&decode_hex(server_proof)?)?;

    if let Some(two_factor_token) = finalize.two_factor_token {
        return Err(AuthError::TwoFactorRequired { two_factor_token }.into());
    }

    let grant = finalize
        .grant
        .ok_or(AuthError::MalformedResponse("access_token"))?;
    unwrap_grant(api, &password, grant)
}

/// Finish a login that required a TOTP code.
///
/// # Arguments
/// * `two_factor_token` - The token carried by
///   [`AuthError::TwoFactorRequired`].
/// * `two_factor_code` - The six-digit TOTP code typed by the user.
/// * `password` - The account password, needed again to unwrap the keys.
pub async fn login_two_factor(
    api: &ApiClient,
    two_factor_token: &str,
    two_factor_code: &str,
    password: &str,
) -> Result<LoginResult> {
    let password = normalize_password(password);
    let response = api.login_two_factor(two_factor_token, two_factor_code).await?;
    let grant = response
        .grant
        .ok_or(AuthError::MalformedResponse("access_token"))?;
    unwrap_grant(api, &password, grant)
}

/// Rehydrate private keys from the `serialized_keys` JSON a caller stored.
pub fn keys_from_serialized(serialized: &str) -> Result<DecryptedKeys> {
    let value: Value = serde_json::from_str(serialized)?;
    let rsa_jwk = value
        .get("rsaPrivateKey")
        .ok_or(AuthError::MalformedResponse("rsaPrivateKey"))?;
    let ecdsa_jwk = value
        .get("ecdsaPrivateKey")
        .ok_or(AuthError::MalformedResponse("ecdsaPrivateKey"))?;

    Ok(DecryptedKeys {
        rsa_private: jwk::rsa_private_from_jwk(&rsa_jwk.to_string())?,
        ecdsa_private: jwk::ec_private_from_jwk(&ecdsa_jwk.to_string())?,
    })
}

fn unwrap_grant(api: &ApiClient, password: &str, grant: AccessGrant) -> Result<LoginResult> {
    let rsa_private = vault::unwrap(
        password,
        &grant.rsa_encrypted_private_key,
        KeyAlgorithm::Rsa,
    )?
    .into_rsa()?;
    let ecdsa_private = vault::unwrap(
        password,
        &grant.ecdsa_encrypted_private_key,
        KeyAlgorithm::Ecdsa,
    )?
    .into_ecdsa()?;

    let serialized_keys = json!({
        "rsaPrivateKey": serde_json::from_str::<Value>(&jwk::rsa_private_to_jwk(&rsa_private)?)?,
        "ecdsaPrivateKey": serde_json::from_str::<Value>(&jwk::ec_private_to_jwk(&ecdsa_private))?,
    })
    .to_string();

    api.set_tokens(
        Some(grant.access_token.clone()),
        Some(grant.refresh_token.clone()),
    );

    Ok(LoginResult {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        device_id: grant.device_id,
        rsa_public_key: grant.rsa_public_key,
        ecdsa_public_key: grant.ecdsa_public_key,
        keys: DecryptedKeys {
            rsa_private,
            ecdsa_private,
        },
        serialized_keys,
    })
}
