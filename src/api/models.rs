//! Wire models for the relay's HTTP API.
//!
//! The relay speaks snake_case JSON; public key fields are JSON strings
//! holding a JWK (double-encoded for wire compatibility with the browser
//! clients). Wrapped private keys travel as `{wrappedKey, salt, iv}`.

use serde::{Deserialize, Serialize};

use crate::crypto::vault::WrappedKey;

/// Request body for `POST /users/login-salt`.
#[derive(Debug, Serialize)]
pub struct LoginSaltRequest {
    /// Normalized account email.
    pub email: String,
}

/// Response of `POST /users/login-salt`.
#[derive(Debug, Deserialize)]
pub struct LoginSaltResponse {
    /// Hex-encoded SRP salt.
    pub srp_salt: String,
}

/// Request body for `POST /users/login-generate-ephemeral`.
#[derive(Debug, Serialize)]
pub struct LoginEphemeralRequest {
    /// Normalized account email.
    pub email: String,
    /// Hex-encoded client public ephemeral A.
    pub client_ephemeral_public: String,
}

/// Response of `POST /users/login-generate-ephemeral`.
#[derive(Debug, Deserialize)]
pub struct LoginEphemeralResponse {
    /// Hex-encoded server public ephemeral B.
    pub server_ephemeral_public: String,
    /// Opaque handle tying the rest of the login to this challenge.
    pub login_session_key: String,
}

/// Request body for `POST /users/login-finalize`.
#[derive(Debug, Serialize)]
pub struct LoginFinalizeRequest {
    /// Handle from [`LoginEphemeralResponse`].
    pub login_session_key: String,
    /// Hex-encoded client session proof M1.
    pub client_session_proof: String,
}

/// Response of `POST /users/login-finalize` and
/// `POST /users/login-two-factor`.
///
/// Carries either a pending two-factor challenge or the final grant; the
/// server session proof is present in both cases and MUST be verified
/// before anything else is trusted.
#[derive(Debug, Deserialize)]
pub struct LoginFinalizeResponse {
    /// Hex-encoded server session proof M2 (absent on the two-factor
    /// follow-up call, where SRP verification already happened).
    pub server_session_proof: Option<String>,
    /// Present when a TOTP code is required to finish the login.
    pub two_factor_token: Option<String>,
    /// Final grant, present once authentication is complete.
    #[serde(flatten)]
    pub grant: Option<AccessGrant>,
}

/// Tokens and key material released after full authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessGrant {
    /// Bearer token for HTTP and socket authentication.
    pub access_token: String,
    /// Long-lived token used to mint fresh access tokens.
    pub refresh_token: String,
    /// Relay-assigned device id.
    pub device_id: Option<String>,
    /// Wrapped RSA private key.
    pub rsa_encrypted_private_key: WrappedKey,
    /// Wrapped ECDSA private key.
    pub ecdsa_encrypted_private_key: WrappedKey,
    /// Own RSA public key, JWK string.
    pub rsa_public_key: String,
    /// Own ECDSA public key, JWK string.
    pub ecdsa_public_key: String,
}

/// Request body for `POST /users/login-two-factor`.
#[derive(Debug, Serialize)]
pub struct TwoFactorRequest {
    /// Challenge token from [`LoginFinalizeResponse`].
    pub two_factor_token: String,
    /// Six-digit TOTP code.
    pub two_factor_code: String,
}

/// Request body for `POST /users/signup` and `POST /invitations/accept`.
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Normalized email.
    pub email: String,
    /// UI language hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Invitation token (`/invitations/accept` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Hex-encoded SRP salt.
    pub srp_salt: String,
    /// Hex-encoded SRP verifier.
    pub srp_verifier: String,
    /// Own RSA public key, JWK string.
    pub rsa_public_key: String,
    /// Wrapped RSA private key.
    pub rsa_encrypted_private_key: WrappedKey,
    /// Own ECDSA public key, JWK string.
    pub ecdsa_public_key: String,
    /// Wrapped ECDSA private key.
    pub ecdsa_encrypted_private_key: WrappedKey,
}

/// Response of `GET /users/access-token` and `GET /instances/access-token`.
#[derive(Debug, Deserialize)]
pub struct AccessTokenResponse {
    /// Fresh bearer token.
    pub access_token: String,
}

/// One instance as returned by `GET /instances`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDto {
    /// Relay-assigned instance id.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// Instance RSA public key, JWK string.
    pub rsa_public_key: String,
    /// Instance ECDSA public key, JWK string.
    pub ecdsa_public_key: String,
    /// Whether this is the account's primary instance.
    #[serde(default)]
    pub primary_instance: bool,
}

/// One peer user as returned by `GET /instances/users`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceUserDto {
    /// Relay-assigned user id.
    pub id: String,
    /// The user's id inside Gladys 4, when linked.
    pub gladys_4_user_id: Option<String>,
    /// Whether the user currently holds a socket connection to the relay.
    #[serde(default)]
    pub connected: bool,
    /// User RSA public key, JWK string.
    pub rsa_public_key: String,
    /// User ECDSA public key, JWK string.
    pub ecdsa_public_key: String,
}

/// Request body for `POST /backups/multi_parts/initialize`.
#[derive(Debug, Serialize)]
pub struct MultipartInitializeRequest {
    /// Backup file name.
    pub file_name: String,
    /// Number of parts the client will upload.
    pub parts: u32,
}

/// Response of `POST /backups/multi_parts/initialize`.
#[derive(Debug, Deserialize)]
pub struct MultipartInitializeResponse {
    /// Upload id to pass to finalize/abort.
    pub file_id: String,
    /// Storage key of the backup object.
    pub file_key: String,
    /// One presigned URL per part, in order.
    pub parts: Vec<PresignedPart>,
}

/// One presigned part URL.
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Presigned PUT URL.
    pub signed_url: String,
}

/// One uploaded part, echoed back on finalize.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedPart {
    /// 1-based part number.
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    /// ETag returned by the storage PUT.
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Request body for `POST /backups/multi_parts/finalize`.
#[derive(Debug, Serialize)]
pub struct MultipartFinalizeRequest {
    /// Upload id from initialize.
    pub file_id: String,
    /// Storage key from initialize.
    pub file_key: String,
    /// All uploaded parts with their etags.
    pub parts: Vec<UploadedPart>,
    /// Size of the backup in bytes.
    pub backup_size: u64,
}

/// Request body for `POST /backups/multi_parts/abort`.
#[derive(Debug, Serialize)]
pub struct MultipartAbortRequest {
    /// Upload id from initialize.
    pub file_id: String,
    /// Storage key from initialize.
    pub file_key: String,
}

/// One backup as returned by `GET /backups`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupDto {
    /// Backup id.
    pub id: String,
    /// Signed download URL, when available.
    pub path: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Creation timestamp, RFC 3339.
    pub created_at: Option<String>,
}
