//! Provider abstraction layer for Cadence.
//!
//! This crate defines the uniform interface the orchestrator uses to talk to
//! LLM backends. The orchestration core only ever depends on these traits,
//! never on a concrete vendor SDK.

mod error;
mod request;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::ProviderError;
pub use request::{
    CompletionRequest, CompletionResponse, DEFAULT_TIMEOUT_MS, Fingerprint, HealthStatus,
    StreamChunk, TokenUsage,
};

/// A stream of completion chunks.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Uniform interface to one LLM backend.
///
/// All adapters must be `Send + Sync` so a single instance can serve many
/// agents concurrently.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the provider name this adapter is registered under.
    fn name(&self) -> &str;

    /// Generates a completion for the request.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the call fails.
    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    /// Generates a streamed completion.
    ///
    /// The default implementation performs a regular completion and yields
    /// it as a single final chunk.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the stream cannot be established.
    async fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.complete(request).await?;
        let chunk = StreamChunk { delta: response.text, done: true, usage: response.usage };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Computes an embedding vector for the text.
    ///
    /// # Errors
    /// Returns `ProviderError::Unsupported` unless the adapter overrides it.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let _ = text;
        Err(ProviderError::Unsupported(format!("'{}' does not provide embeddings", self.name())))
    }

    /// Probes the backend.
    async fn health_check(&self) -> HealthStatus;
}

/// Produces embedding vectors for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Computes an embedding vector for the text.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the embedding cannot be computed.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}
