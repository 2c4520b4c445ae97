//! Response caching for provider calls.
//!
//! Responses are keyed by request fingerprint. An optional similarity mode
//! reuses responses for near-identical idempotent requests. Entries expire
//! by TTL (lazily on lookup and via a periodic sweep) and are evicted LRU
//! when the cache is full.

#[allow(clippy::module_inception)]
pub mod cache;
pub mod config;
pub mod types;

pub use cache::ResponseCache;
pub use config::{CacheConfig, CacheConfigError};
pub use types::{CacheEntry, CacheHit, CacheStats, HitKind};
