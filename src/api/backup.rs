//! Backup upload control and backup-key protection.
//!
//! Backups are encrypted locally by the instance; the relay only brokers
//! multipart uploads to object storage through presigned URLs. The backup
//! encryption key itself travels as a regular envelope encrypted to the
//! instance's own RSA key, so recovery months later is possible with the
//! timestamp check disabled.

use p256::ecdsa::{SigningKey, VerifyingKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};

use super::client::ApiClient;
use super::models::{
    BackupDto, MultipartAbortRequest, MultipartFinalizeRequest, MultipartInitializeRequest,
    MultipartInitializeResponse, UploadedPart,
};
use crate::crypto::envelope::{self, DecryptOptions, Envelope};
use crate::error::{Error, Result};

/// Multipart backup operations, layered over an [`ApiClient`].
pub struct BackupClient<'a> {
    api: &'a ApiClient,
    http: reqwest::Client,
}

impl<'a> BackupClient<'a> {
    /// Create a backup client.
    pub fn new(api: &'a ApiClient) -> Result<Self> {
        // Separate plain client for presigned URLs: those are storage URLs,
        // not relay endpoints, and must not carry the authorization header.
        let http = reqwest::Client::builder()
            .user_agent(super::client::USER_AGENT)
            .build()?;
        Ok(Self { api, http })
    }

    /// Start a multipart upload of `parts` chunks.
    pub async fn initialize(
        &self,
        file_name: &str,
        parts: u32,
    ) -> Result<MultipartInitializeResponse> {
        let value = self
            .api
            .post(
                "/backups/multi_parts/initialize",
                &serde_json::to_value(MultipartInitializeRequest {
                    file_name: file_name.to_string(),
                    parts,
                })?,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Upload one chunk to its presigned URL.
    ///
    /// # Returns
    /// The storage ETag, to echo back on finalize.
    pub async fn upload_part(&self, signed_url: &str, chunk: Vec<u8>) -> Result<String> {
        let response = self
            .http
            .put(signed_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: Value::Null,
            });
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(etag)
    }

    /// Finish a multipart upload.
    pub async fn finalize(
        &self,
        file_id: &str,
        file_key: &str,
        parts: Vec<UploadedPart>,
        backup_size: u64,
    ) -> Result<Value> {
        self.api
            .post(
                "/backups/multi_parts/finalize",
                &serde_json::to_value(MultipartFinalizeRequest {
                    file_id: file_id.to_string(),
                    file_key: file_key.to_string(),
                    parts,
                    backup_size,
                })?,
            )
            .await
    }

    /// Abort a multipart upload, releasing the partial object.
    pub async fn abort(&self, file_id: &str, file_key: &str) -> Result<Value> {
        self.api
            .post(
                "/backups/multi_parts/abort",
                &serde_json::to_value(MultipartAbortRequest {
                    file_id: file_id.to_string(),
                    file_key: file_key.to_string(),
                })?,
            )
            .await
    }

    /// List available backups.
    pub async fn list(&self) -> Result<Vec<BackupDto>> {
        let value = self.api.get("/backups").await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Download a backup from its signed URL.
    pub async fn download(&self, signed_url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(signed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: Value::Null,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Protect a backup encryption key under our own keypair.
///
/// The key is hex-encoded and sealed in an envelope addressed to ourselves;
/// only a device holding the RSA private key can recover it.
pub fn encrypt_backup_key(
    own_rsa_public: &RsaPublicKey,
    own_signer: &SigningKey,
    backup_key: &[u8],
) -> Result<Envelope> {
    let payload = json!({ "backupKey": hex::encode(backup_key) });
    Ok(envelope::encrypt(own_rsa_public, own_signer, &payload)?)
}

/// Recover a backup encryption key sealed with [`encrypt_backup_key`].
///
/// The envelope may be months old, so the freshness check is disabled; the
/// signature check still runs.
pub fn decrypt_backup_key(
    own_rsa_private: &RsaPrivateKey,
    own_verifier: &VerifyingKey,
    sealed: &Envelope,
) -> Result<Vec<u8>> {
    let payload = envelope::decrypt(
        own_rsa_private,
        own_verifier,
        sealed,
        DecryptOptions {
            disable_timestamp_check: true,
        },
    )?;
    let hex_key = payload
        .get("backupKey")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            crate::crypto::CryptoError::InvalidJwk("missing backupKey field".to_string())
        })?;
    Ok(crate::crypto::decode_hex(hex_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{keys, random_bytes};

    #[test]
    fn test_backup_key_recovery_after_months() {
        let generated = keys::generate_keys().unwrap();
        let signer = SigningKey::from(&generated.ecdsa_private);
        let verifier = VerifyingKey::from(&generated.ecdsa_public);

        // Seal with a timestamp far beyond the freshness window, as if the
        // backup key had been uploaded months before recovery.
        let backup_key = random_bytes(32);
        let sealed = crate::crypto::envelope::encrypt_at(
            &generated.rsa_public,
            &signer,
            &serde_json::json!({ "backupKey": hex::encode(&backup_key) }),
            chrono::Utc::now().timestamp_millis() - 120 * 24 * 3600 * 1000,
        )
        .unwrap();

        let recovered = decrypt_backup_key(&generated.rsa_private, &verifier, &sealed).unwrap();
        assert_eq!(recovered, backup_key);
    }

    #[test]
    fn test_backup_key_rejects_foreign_signature() {
        let ours = keys::generate_keys().unwrap();
        let theirs = keys::generate_keys().unwrap();
        let foreign_signer = SigningKey::from(&theirs.ecdsa_private);
        let our_verifier = VerifyingKey::from(&ours.ecdsa_public);

        let backup_key = random_bytes(32);
        let sealed = encrypt_backup_key(&ours.rsa_public, &foreign_signer, &backup_key).unwrap();

        let result = decrypt_backup_key(&ours.rsa_private, &our_verifier, &sealed);
        assert!(result.is_err());
    }
}
