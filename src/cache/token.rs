//! Session-scoped access-token cache
//!
//! Single fixed key holding `{token, timestamp}`. Expired or corrupt data is a
//! miss and is purged on the lookup that finds it.

use crate::cache::entry::{decode, CacheEntry};
use crate::cache::store::KeyValueStore;
use crate::domain::types::epoch_ms;
use crate::infra::metrics::{CacheKind, Metrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const TOKEN_CACHE_KEY: &str = "mapbox_token";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredToken {
    token: String,
}

pub struct AccessTokenCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl AccessTokenCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self { store, ttl, metrics }
    }

    pub fn get(&self) -> Option<String> {
        self.get_at(epoch_ms())
    }

    pub fn get_at(&self, now_ms: u64) -> Option<String> {
        let token = self.lookup(now_ms);
        match token {
            Some(_) => self.metrics.record_cache_hit(CacheKind::Token),
            None => self.metrics.record_cache_miss(CacheKind::Token),
        }
        token
    }

    fn lookup(&self, now_ms: u64) -> Option<String> {
        let raw = match self.store.get(TOKEN_CACHE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "token_cache_read_failed");
                return None;
            }
        };

        let entry: CacheEntry<StoredToken> = match decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "token_cache_corrupt");
                self.purge();
                return None;
            }
        };

        if !entry.is_valid(now_ms, self.ttl) {
            debug!(written_at = %entry.written_at, "token_cache_expired");
            self.purge();
            return None;
        }

        Some(entry.value.token)
    }

    pub fn set(&self, token: &str) {
        self.set_at(token, epoch_ms());
    }

    pub fn set_at(&self, token: &str, now_ms: u64) {
        let entry = CacheEntry::new(StoredToken { token: token.to_string() }, now_ms);
        let result = serde_json::to_string(&entry)
            .map_err(|e| e.to_string())
            .and_then(|json| self.store.set(TOKEN_CACHE_KEY, &json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(error = %e, "token_cache_write_failed");
        }
    }

    pub fn clear(&self) {
        self.purge();
    }

    fn purge(&self) {
        if let Err(e) = self.store.remove(TOKEN_CACHE_KEY) {
            warn!(error = %e, "token_cache_purge_failed");
        }
    }
}
