//! Bounded in-memory reverse-geocode cache
//!
//! Keys are coordinates rounded to two decimal degrees (~1.1 km cells) so nearby
//! lookups share an entry. Eviction is strict insertion-order FIFO: inserting a
//! new key into a full cache drops the single oldest-inserted key. Overwriting an
//! existing key refreshes its value without moving it in the queue.

use crate::cache::entry::CacheEntry;
use crate::domain::types::{epoch_ms, ReverseGeocodeResult};
use crate::infra::metrics::{CacheKind, Metrics};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REVERSE_CAPACITY: usize = 100;
pub const DEFAULT_REVERSE_TTL: Duration = Duration::from_secs(60 * 60);

/// Grid-cell key for a coordinate pair
pub fn grid_key(lat: f64, lng: f64) -> String {
    // Adding 0.0 folds -0.0 into 0.0 so both sides of the meridian share a key
    let round = |v: f64| (v * 100.0).round() / 100.0 + 0.0;
    format!("{:.2},{:.2}", round(lat), round(lng))
}

#[derive(Default)]
struct ReverseInner {
    entries: FxHashMap<String, CacheEntry<ReverseGeocodeResult>>,
    /// Keys in insertion order, oldest first
    order: VecDeque<String>,
}

impl ReverseInner {
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

pub struct ReverseGeocodeCache {
    inner: Mutex<ReverseInner>,
    capacity: usize,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl ReverseGeocodeCache {
    pub fn new(capacity: usize, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self { inner: Mutex::new(ReverseInner::default()), capacity: capacity.max(1), ttl, metrics }
    }

    pub fn get(&self, lat: f64, lng: f64) -> Option<ReverseGeocodeResult> {
        self.get_at(lat, lng, epoch_ms())
    }

    pub fn get_at(&self, lat: f64, lng: f64, now_ms: u64) -> Option<ReverseGeocodeResult> {
        let key = grid_key(lat, lng);
        let mut inner = self.inner.lock();

        let result = match inner.entries.get(&key) {
            None => None,
            Some(entry) if entry.is_valid(now_ms, self.ttl) => Some(entry.value.clone()),
            Some(_) => {
                debug!(key = %key, "reverse_cache_expired");
                inner.remove(&key);
                None
            }
        };

        match result {
            Some(_) => self.metrics.record_cache_hit(CacheKind::Reverse),
            None => self.metrics.record_cache_miss(CacheKind::Reverse),
        }
        result
    }

    pub fn set(&self, lat: f64, lng: f64, value: ReverseGeocodeResult) {
        self.set_at(lat, lng, value, epoch_ms());
    }

    pub fn set_at(&self, lat: f64, lng: f64, value: ReverseGeocodeResult, now_ms: u64) {
        let key = grid_key(lat, lng);
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(&key) {
            *entry = CacheEntry::new(value, now_ms);
            return;
        }

        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                debug!(evicted = %oldest, "reverse_cache_evicted");
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry::new(value, now_ms));
    }

    /// Whether the cell for this coordinate holds an entry, ignoring TTL
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        self.inner.lock().entries.contains_key(&grid_key(lat, lng))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
