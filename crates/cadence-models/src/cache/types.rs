//! Core data types for response caching.

use cadence_abstraction::{CompletionResponse, Fingerprint};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// A cached provider response.
///
/// The payload is immutable once created; only the LRU recency tick moves.
#[derive(Debug)]
pub struct CacheEntry {
    /// The request fingerprint this entry answers.
    pub fingerprint: Fingerprint,
    /// The cached response.
    pub response: CompletionResponse,
    /// Embedding of the request content, present only when similarity search is on.
    pub embedding: Option<Vec<f32>>,
    /// When the entry was stored.
    pub created_at: Instant,
    /// When the entry stops being served.
    pub expires_at: Instant,
    last_access: AtomicU64,
}

impl CacheEntry {
    /// Creates a new cache entry.
    ///
    /// # Arguments
    /// * `fingerprint` - The request fingerprint
    /// * `response` - The response to cache
    /// * `embedding` - Optional request embedding
    /// * `expires_at` - Expiry instant
    /// * `tick` - Initial recency tick
    #[must_use]
    pub fn new(
        fingerprint: Fingerprint,
        response: CompletionResponse,
        embedding: Option<Vec<f32>>,
        expires_at: Instant,
        tick: u64,
    ) -> Self {
        Self {
            fingerprint,
            response,
            embedding,
            created_at: Instant::now(),
            expires_at,
            last_access: AtomicU64::new(tick),
        }
    }

    /// Whether the entry is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Records an access with the given recency tick.
    pub fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    /// Returns the last recency tick.
    #[must_use]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitKind {
    /// Fingerprint matched exactly.
    Exact,
    /// An entry with a similar request embedding was reused.
    Similar {
        /// Cosine similarity of the match.
        similarity: f32,
    },
}

/// A successful cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// The cached response.
    pub response: CompletionResponse,
    /// How the hit was found.
    pub kind: HitKind,
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Exact fingerprint hits.
    pub exact_hits: u64,
    /// Similarity hits.
    pub similar_hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed by LRU pressure.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Embedder calls that failed; those requests fell back to exact matching only.
    pub embedding_failures: u64,
    /// Current number of entries.
    pub size: usize,
}

impl CacheStats {
    /// Total hits of either kind.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.exact_hits + self.similar_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_abstraction::CompletionRequest;
    use std::time::Duration;

    fn response() -> CompletionResponse {
        CompletionResponse {
            text: "cached".to_string(),
            usage: None,
            provider: "mock".to_string(),
            model: None,
            latency_ms: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let fp = CompletionRequest::new("x").fingerprint();
        let entry =
            CacheEntry::new(fp, response(), None, Instant::now() + Duration::from_secs(5), 1);
        assert!(!entry.is_expired_at(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(entry.is_expired_at(Instant::now()));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let fp = CompletionRequest::new("x").fingerprint();
        let entry = CacheEntry::new(fp, response(), None, Instant::now(), 4);
        entry.touch(9);
        entry.touch(7);
        assert_eq!(entry.last_access(), 9);
    }

    #[test]
    fn test_stats_hits() {
        let stats = CacheStats { exact_hits: 2, similar_hits: 3, ..CacheStats::default() };
        assert_eq!(stats.hits(), 5);
    }
}
