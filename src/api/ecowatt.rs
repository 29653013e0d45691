//! Cached access to the Ecowatt grid-tension feed.
//!
//! The upstream feed is rate-limited, so signals are cached client-side for
//! 30 minutes. The cache is time-evicted only; there is no manual
//! invalidation.

use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::client::ApiClient;
use crate::error::Result;

/// How long a fetched signal set stays valid.
pub const ECOWATT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// 30-minute TTL cache over `GET /ecowatt/v4/signals`.
pub struct EcowattCache {
    cached: Mutex<Option<(Instant, Value)>>,
}

impl EcowattCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Fetch the Ecowatt signals, hitting the relay at most once per TTL.
    pub async fn get_signals(&self, api: &ApiClient) -> Result<Value> {
        let mut cached = self.cached.lock().await;
        if let Some((fetched_at, value)) = cached.as_ref() {
            if fetched_at.elapsed() < ECOWATT_CACHE_TTL {
                return Ok(value.clone());
            }
        }

        let fresh = api.get("/ecowatt/v4/signals").await?;
        *cached = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}

impl Default for EcowattCache {
    fn default() -> Self {
        Self::new()
    }
}
