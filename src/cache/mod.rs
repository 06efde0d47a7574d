//! Tiered caches that prevent redundant network calls
//!
//! Three independently configured tiers, each owned by its consumer:
//! - `token` - session-scoped access token, single key, 24h TTL
//! - `geocode` - durable venue geocodes, 30 day TTL, unbounded
//! - `reverse` - in-memory reverse geocodes, 100 entries, FIFO eviction
//!
//! Expired and corrupt entries are misses, purged on the lookup that finds them.

pub mod entry;
pub mod geocode;
pub mod reverse;
pub mod store;
pub mod token;

pub use entry::CacheEntry;
pub use geocode::GeocodeCache;
pub use reverse::ReverseGeocodeCache;
pub use store::{FileStore, KeyValueStore, SessionStore};
pub use token::AccessTokenCache;
