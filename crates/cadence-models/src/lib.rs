//! Provider implementations and response caching for Cadence.
//!
//! This crate provides concrete `ProviderAdapter` implementations (a scripted
//! mock and an OpenAI-compatible HTTP client), the factory that builds them
//! from configuration, and the `ResponseCache` the load balancer consults
//! before dispatch.

pub mod cache;
pub mod embedding;
pub mod factory;
pub mod mock;
pub mod openai;

pub use cache::{
    CacheConfig, CacheConfigError, CacheEntry, CacheHit, CacheStats, HitKind, ResponseCache,
};
pub use embedding::{AdapterEmbedder, HashingEmbedder, cosine_similarity};
pub use factory::{MockReply, MockSettings, ProviderConfig, ProviderFactory, ProviderKind};
pub use mock::MockProvider;
pub use openai::OpenAiCompatibleProvider;
