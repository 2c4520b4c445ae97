//! ResponseCache implementation with exact and similarity lookup, TTL and LRU eviction.

use cadence_abstraction::{CompletionRequest, CompletionResponse, Embedder, Fingerprint};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{CacheConfig, CacheConfigError};
use super::types::{CacheEntry, CacheHit, CacheStats, HitKind};
use crate::embedding::cosine_similarity;

const SHARD_COUNT: usize = 16;

type Shard = RwLock<HashMap<Fingerprint, Arc<CacheEntry>>>;

#[derive(Debug, Default)]
struct Counters {
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    embedding_failures: AtomicU64,
}

/// Content-addressable cache of provider responses.
///
/// Entries are spread over independently locked shards chosen by fingerprint,
/// so concurrent readers only ever share a read lock and writers to the same
/// fingerprint are serialized by their shard. There is no cache-wide lock.
pub struct ResponseCache {
    shards: Vec<Shard>,
    config: CacheConfig,
    embedder: Option<Arc<dyn Embedder>>,
    len: AtomicUsize,
    clock: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("has_embedder", &self.embedder.is_some())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a new response cache with the given configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if the configuration is invalid.
    pub fn new(config: CacheConfig) -> Result<Self, CacheConfigError> {
        config.validate()?;

        Ok(Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            config,
            embedder: None,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    /// Attaches the embedder used for similarity search.
    ///
    /// Without an embedder, similarity lookup stays off even when enabled in config.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Get the cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up a response for the request.
    pub async fn lookup(&self, request: &CompletionRequest) -> Option<CompletionResponse> {
        self.lookup_hit(request).await.map(|hit| hit.response)
    }

    /// Looks up a response for the request, reporting how it was found.
    ///
    /// The exact fingerprint is tried first. Similarity search only runs when
    /// enabled, an embedder is attached and the request is idempotent.
    pub async fn lookup_hit(&self, request: &CompletionRequest) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }

        let fingerprint = request.fingerprint();
        if let Some(response) = self.get_exact(&fingerprint) {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint, "Cache hit");
            return Some(CacheHit { response, kind: HitKind::Exact });
        }

        if let Some(embedder) = self.similarity_embedder(request) {
            match embedder.embed(&request.content()).await {
                Ok(embedding) => {
                    if let Some((response, similarity)) = self.find_similar(&embedding) {
                        self.counters.similar_hits.fetch_add(1, Ordering::Relaxed);
                        debug!(fingerprint = %fingerprint, similarity, "Similarity cache hit");
                        return Some(CacheHit { response, kind: HitKind::Similar { similarity } });
                    }
                }
                Err(e) => {
                    self.counters.embedding_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Failed to embed request for similarity lookup");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "Cache miss");
        None
    }

    /// Stores a response for the request.
    ///
    /// A second store with the same fingerprint replaces the earlier entry.
    pub async fn store(&self, request: &CompletionRequest, response: CompletionResponse) {
        if !self.config.enabled {
            return;
        }

        let embedding = match self.similarity_embedder(request) {
            Some(embedder) => match embedder.embed(&request.content()).await {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    self.counters.embedding_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Failed to embed request, storing without embedding");
                    None
                }
            },
            None => None,
        };

        let fingerprint = request.fingerprint();
        let entry = Arc::new(CacheEntry::new(
            fingerprint.clone(),
            response,
            embedding,
            Instant::now() + self.config.ttl(),
            self.next_tick(),
        ));

        let replaced = {
            let mut shard = self.shard(&fingerprint).write().unwrap_or_else(PoisonError::into_inner);
            shard.insert(fingerprint.clone(), entry).is_some()
        };
        if !replaced {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        debug!(fingerprint = %fingerprint, replaced, "Cached response");

        while self.len.load(Ordering::Relaxed) > self.config.max_entries {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Removes a single entry.
    ///
    /// # Returns
    /// `true` if the entry was removed, `false` if it was not found.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = {
            let mut shard = self.shard(fingerprint).write().unwrap_or_else(PoisonError::into_inner);
            shard.remove(fingerprint).is_some()
        };
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        let mut cleared_count = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            cleared_count += shard.len();
            shard.clear();
        }
        self.len.fetch_sub(cleared_count, Ordering::Relaxed);
        info!(cleared_count, "Cleared response cache");
    }

    /// Removes every expired entry.
    ///
    /// # Returns
    /// The number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired_at(now));
            removed += before - shard.len();
        }
        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::Relaxed);
            self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Spawns the periodic expiry sweep.
    ///
    /// The task runs every `sweep_interval_secs` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        })
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.counters.similar_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            embedding_failures: self.counters.embedding_failures.load(Ordering::Relaxed),
            size: self.len.load(Ordering::Relaxed),
        }
    }

    /// Number of entries currently held (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Shard {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn similarity_embedder(&self, request: &CompletionRequest) -> Option<&Arc<dyn Embedder>> {
        if !self.config.similarity_enabled
            || !request.is_idempotent(self.config.similarity_max_temperature)
        {
            return None;
        }
        self.embedder.as_ref()
    }

    fn get_exact(&self, fingerprint: &Fingerprint) -> Option<CompletionResponse> {
        let now = Instant::now();
        let expired = {
            let shard = self.shard(fingerprint).read().unwrap_or_else(PoisonError::into_inner);
            let entry = shard.get(fingerprint)?;
            if !entry.is_expired_at(now) {
                entry.touch(self.next_tick());
                return Some(entry.response.clone());
            }
            Arc::clone(entry)
        };

        // Lazy expiry: drop the stale entry unless a fresh store replaced it meanwhile.
        let mut shard = self.shard(fingerprint).write().unwrap_or_else(PoisonError::into_inner);
        if shard.get(fingerprint).is_some_and(|current| Arc::ptr_eq(current, &expired)) {
            shard.remove(fingerprint);
            drop(shard);
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint, "Expired cache entry removed on lookup");
        }
        None
    }

    fn find_similar(&self, embedding: &[f32]) -> Option<(CompletionResponse, f32)> {
        let now = Instant::now();
        let mut best: Option<(Arc<CacheEntry>, f32)> = None;

        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for entry in shard.values() {
                if entry.is_expired_at(now) {
                    continue;
                }
                let Some(candidate) = entry.embedding.as_deref() else {
                    continue;
                };
                let similarity = cosine_similarity(embedding, candidate);
                if similarity < self.config.similarity_threshold {
                    continue;
                }
                if best.as_ref().is_none_or(|(_, score)| similarity > *score) {
                    best = Some((Arc::clone(entry), similarity));
                }
            }
        }

        best.map(|(entry, similarity)| {
            entry.touch(self.next_tick());
            (entry.response.clone(), similarity)
        })
    }

    /// Evicts the least-recently-used entry across all shards.
    fn evict_lru(&self) -> bool {
        let mut oldest: Option<Arc<CacheEntry>> = None;
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for entry in shard.values() {
                if oldest.as_ref().is_none_or(|o| entry.last_access() < o.last_access()) {
                    oldest = Some(Arc::clone(entry));
                }
            }
        }

        let Some(victim) = oldest else {
            return false;
        };

        let mut shard =
            self.shard(&victim.fingerprint).write().unwrap_or_else(PoisonError::into_inner);
        if shard.get(&victim.fingerprint).is_some_and(|current| Arc::ptr_eq(current, &victim)) {
            shard.remove(&victim.fingerprint);
            drop(shard);
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!(fingerprint = %victim.fingerprint, "Evicted LRU response from cache");
        }
        true
    }
}
