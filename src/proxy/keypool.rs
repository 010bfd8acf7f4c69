//! Ordered pool of upstream API keys with failover.

use rand::Rng;
use tracing::{info, warn};

use super::upstream::{Upstream, UpstreamError};
use crate::types::GenerateRequest;

/// Environment variable holding the comma-separated key list.
pub const KEYS_ENV_VAR: &str = "MENTOR_API_KEYS";

pub struct KeyPool {
    keys: Vec<String>,
}

impl KeyPool {
    /// Builds a pool from raw entries, discarding empty ones. Order is
    /// preserved and is the failover order.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();
        info!("[KeyPool] {} key(s) configured", keys.len());
        Self { keys }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var(KEYS_ENV_VAR).unwrap_or_default();
        Self::new(raw.split(',').map(str::to_string))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// A uniformly random key, for handing out to live voice sessions so load
    /// spreads across the pool.
    pub fn random_key(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.keys.len());
        Some(&self.keys[index])
    }

    /// Runs `generate` against each key in order until one succeeds. A
    /// `BadRequest` aborts immediately since no other key can fix a broken
    /// request; any other failure rotates to the next key, and exhaustion
    /// returns the last failure seen.
    pub async fn execute_with_failover<U: Upstream>(
        &self,
        upstream: &U,
        request: &GenerateRequest,
    ) -> Result<String, UpstreamError> {
        if self.keys.is_empty() {
            return Err(UpstreamError::NoKeys);
        }

        let mut last_error = UpstreamError::NoKeys;
        for (i, key) in self.keys.iter().enumerate() {
            match upstream.generate(key, request).await {
                Ok(text) => return Ok(text),
                Err(UpstreamError::BadRequest(detail)) => {
                    warn!("[KeyPool] Key #{} got a bad-request answer, aborting rotation", i + 1);
                    return Err(UpstreamError::BadRequest(detail));
                }
                Err(e) => {
                    warn!("[KeyPool] Key #{} failed ({}), rotating", i + 1, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
