//! Embedders used by similarity cache lookup.

use async_trait::async_trait;
use cadence_abstraction::{Embedder, ProviderAdapter, ProviderError};
use std::sync::Arc;

const DEFAULT_DIMENSIONS: usize = 256;

/// Deterministic, local feature-hashing embedder.
///
/// Lower-cased alphanumeric words are hashed (FNV-1a) into a fixed number of
/// buckets and the vector is L2-normalized. It needs no provider call, which
/// keeps similarity lookup cheap and reproducible.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// Creates an embedder with the given number of dimensions (at least 1).
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    /// Embeds text synchronously.
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
        {
            let bucket = (fnv1a(token.as_bytes()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }
}

/// Uses a provider's embedding endpoint.
#[derive(Clone)]
pub struct AdapterEmbedder {
    adapter: Arc<dyn ProviderAdapter>,
}

impl AdapterEmbedder {
    /// Wraps a provider adapter.
    #[must_use]
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self { adapter }
    }
}

impl std::fmt::Debug for AdapterEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterEmbedder").field("provider", &self.adapter.name()).finish()
    }
}

#[async_trait]
impl Embedder for AdapterEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.adapter.embed(text).await
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched lengths or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|y| y * y).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text_has_similarity_one() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_text("Parallel agents share providers");
        let b = embedder.embed_text("parallel   AGENTS share providers!");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vectors_are_normalized() {
        let embedder = HashingEmbedder::new(32);
        let v = embedder.embed_text("one two three three");
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), 32);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed_text("   ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert!(cosine_similarity(&v, &v).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0]).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_embedder_trait_matches_sync() {
        let embedder = HashingEmbedder::default();
        let via_trait = Embedder::embed(&embedder, "cache me").await.unwrap();
        assert_eq!(via_trait, embedder.embed_text("cache me"));
    }
}
