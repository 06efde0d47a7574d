//! Timestamped cache entries
//!
//! TTL belongs to the cache instance, not the entry. An entry written at `t`
//! is valid for every query at `now <= t + ttl` and invalid afterwards.

use crate::infra::error::CacheReadError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    #[serde(flatten)]
    pub value: T,
    /// Epoch milliseconds of the write
    #[serde(rename = "timestamp")]
    pub written_at: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, written_at: u64) -> Self {
        Self { value, written_at }
    }

    /// Entries stamped in the future (clock skew) count as age zero
    #[inline]
    pub fn is_valid(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.written_at) <= ttl.as_millis() as u64
    }
}

/// Decode persisted JSON, reporting corruption as a read error
pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CacheReadError> {
    Ok(serde_json::from_str(raw)?)
}
