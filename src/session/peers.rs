//! Peer key directory.
//!
//! Client-side cache of peer public keys and presence, keyed by the
//! relay-assigned id. Entries are created on first need or on explicit
//! refresh, invalidated only by a `clear-key-cache` notification, and keep
//! the raw JWK strings so upper layers can compute stable fingerprints.

use p256::ecdsa::VerifyingKey;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::api::ApiClient;
use crate::api::models::InstanceUserDto;
use crate::crypto::jwk;
use crate::error::Result;

/// One peer's keys and presence.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Relay-assigned peer id.
    pub id: String,
    /// The peer's user id inside Gladys 4, when linked.
    pub gladys_4_user_id: Option<String>,
    /// Whether the peer currently holds a socket to the relay.
    pub connected: bool,
    /// Parsed RSA encryption public key.
    pub rsa_public_key: RsaPublicKey,
    /// Parsed ECDSA verification key.
    pub ecdsa_public_key: VerifyingKey,
    /// Exact RSA JWK string as received, for fingerprinting.
    pub rsa_public_key_raw: String,
    /// Exact ECDSA JWK string as received, for fingerprinting.
    pub ecdsa_public_key_raw: String,
}

fn parse_entry(dto: InstanceUserDto) -> Result<PeerEntry> {
    let rsa_public_key = jwk::rsa_public_from_jwk(&dto.rsa_public_key)?;
    let ecdsa_public_key = VerifyingKey::from(&jwk::ec_public_from_jwk(&dto.ecdsa_public_key)?);
    Ok(PeerEntry {
        id: dto.id,
        gladys_4_user_id: dto.gladys_4_user_id,
        connected: dto.connected,
        rsa_public_key,
        ecdsa_public_key,
        rsa_public_key_raw: dto.rsa_public_key,
        ecdsa_public_key_raw: dto.ecdsa_public_key,
    })
}

/// Cache of peer public keys, keyed by relay peer id.
pub struct PeerDirectory {
    entries: Mutex<HashMap<String, PeerEntry>>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// O(1) lookup by relay peer id.
    pub async fn get(&self, id: &str) -> Option<PeerEntry> {
        self.entries.lock().await.get(id).cloned()
    }

    /// Drop every entry. Response to a `clear-key-cache` event.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of cached peers.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the directory is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// A snapshot of every cached entry.
    pub async fn snapshot(&self) -> Vec<PeerEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Fetch the authoritative peer list from the relay.
    ///
    /// Already-cached ids only get their `connected` flag updated, so a
    /// presence refresh never discards parsed keys; new ids are inserted
    /// fully parsed. Entries are never evicted here, only by [`clear`].
    ///
    /// A peer with unparseable keys is skipped with a warning rather than
    /// failing the whole refresh.
    ///
    /// [`clear`]: PeerDirectory::clear
    pub async fn refresh(&self, api: &ApiClient) -> Result<()> {
        let users = api.instance_users().await?;
        let mut entries = self.entries.lock().await;
        for dto in users {
            match entries.get_mut(&dto.id) {
                Some(existing) => existing.connected = dto.connected,
                None => {
                    let id = dto.id.clone();
                    match parse_entry(dto) {
                        Ok(entry) => {
                            entries.insert(id, entry);
                        }
                        Err(e) => log::warn!("skipping peer {id} with invalid keys: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Lookup by relay id, refreshing once on a miss.
    pub async fn get_or_refresh(&self, api: &ApiClient, id: &str) -> Result<Option<PeerEntry>> {
        if let Some(entry) = self.get(id).await {
            return Ok(Some(entry));
        }
        self.refresh(api).await?;
        Ok(self.get(id).await)
    }

    /// Linear scan by Gladys 4 user id, refreshing once when absent.
    pub async fn find_by_gladys4_user_id(
        &self,
        api: &ApiClient,
        gladys_4_user_id: &str,
    ) -> Result<Option<PeerEntry>> {
        if let Some(entry) = self.scan_gladys4(gladys_4_user_id).await {
            return Ok(Some(entry));
        }
        self.refresh(api).await?;
        Ok(self.scan_gladys4(gladys_4_user_id).await)
    }

    async fn scan_gladys4(&self, gladys_4_user_id: &str) -> Option<PeerEntry> {
        self.entries
            .lock()
            .await
            .values()
            .find(|entry| entry.gladys_4_user_id.as_deref() == Some(gladys_4_user_id))
            .cloned()
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}
