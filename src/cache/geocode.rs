//! Durable geocode cache keyed by venue name
//!
//! The whole cache is one JSON map under a single store key:
//! `{ "<venue>": { lat, lng, placeName, accuracy, timestamp }, ... }`.
//! Unbounded in entry count. Each read-modify-write runs under one lock.

use crate::cache::entry::{decode, CacheEntry};
use crate::cache::store::KeyValueStore;
use crate::domain::types::{epoch_ms, GeocodeResult};
use crate::infra::error::CacheReadError;
use crate::infra::metrics::{CacheKind, Metrics};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const GEOCODE_CACHE_KEY: &str = "geocode_cache";
pub const DEFAULT_GEOCODE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

type GeocodeMap = HashMap<String, CacheEntry<GeocodeResult>>;

pub struct GeocodeCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    metrics: Arc<Metrics>,
    /// Serializes load-modify-save cycles
    lock: Mutex<()>,
}

impl GeocodeCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self { store, ttl, metrics, lock: Mutex::new(()) }
    }

    pub fn get(&self, venue: &str) -> Option<GeocodeResult> {
        self.get_at(venue, epoch_ms())
    }

    pub fn get_at(&self, venue: &str, now_ms: u64) -> Option<GeocodeResult> {
        let _guard = self.lock.lock();
        let mut map = self.load_or_empty();

        let result = match map.get(venue) {
            None => None,
            Some(entry) if entry.is_valid(now_ms, self.ttl) => Some(entry.value.clone()),
            Some(entry) => {
                debug!(venue = %venue, written_at = %entry.written_at, "geocode_cache_expired");
                map.remove(venue);
                self.save(&map);
                None
            }
        };

        match result {
            Some(_) => self.metrics.record_cache_hit(CacheKind::Geocode),
            None => self.metrics.record_cache_miss(CacheKind::Geocode),
        }
        result
    }

    pub fn set(&self, venue: &str, result: &GeocodeResult) {
        self.set_at(venue, result, epoch_ms());
    }

    pub fn set_at(&self, venue: &str, result: &GeocodeResult, now_ms: u64) {
        let _guard = self.lock.lock();
        let mut map = self.load_or_empty();
        map.insert(venue.to_string(), CacheEntry::new(result.clone(), now_ms));
        self.save(&map);
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock();
        self.load_or_empty().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock();
        if let Err(e) = self.store.remove(GEOCODE_CACHE_KEY) {
            warn!(error = %e, "geocode_cache_clear_failed");
        }
    }

    fn load(&self) -> Result<GeocodeMap, CacheReadError> {
        match self.store.get(GEOCODE_CACHE_KEY)? {
            Some(raw) => decode(&raw),
            None => Ok(GeocodeMap::new()),
        }
    }

    fn load_or_empty(&self) -> GeocodeMap {
        self.load().unwrap_or_else(|e| {
            warn!(error = %e, "geocode_cache_corrupt");
            GeocodeMap::new()
        })
    }

    fn save(&self, map: &GeocodeMap) {
        let result = serde_json::to_string(map)
            .map_err(|e| e.to_string())
            .and_then(|json| self.store.set(GEOCODE_CACHE_KEY, &json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(error = %e, entries = %map.len(), "geocode_cache_write_failed");
        }
    }
}
