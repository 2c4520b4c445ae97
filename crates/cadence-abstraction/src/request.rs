//! Completion request/response types and request fingerprinting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Default per-request timeout (60 seconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Deterministic hash of a normalized request, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request for a single completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The user prompt.
    pub prompt: String,

    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Optional model hint; adapters fall back to their configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,

    /// Maximum number of tokens to generate.
    pub max_tokens: u32,

    /// Sampling temperature, between 0 and 2.
    pub temperature: f32,

    /// Whether the caller wants a streamed completion.
    pub stream: bool,

    /// Per-call timeout in milliseconds. Not part of the fingerprint.
    pub timeout_ms: u64,
}

impl CompletionRequest {
    /// Creates a request with default parameters.
    ///
    /// Defaults: 1024 max tokens, temperature 0.2, non-streaming, 60s timeout.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            model_hint: None,
            max_tokens: 1024,
            temperature: 0.2,
            stream: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the model hint.
    #[must_use]
    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    /// Sets max tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the temperature, clamped to 0.0-2.0.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Sets the streaming flag.
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Sets the timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// The text used for similarity search (system prompt + prompt).
    #[must_use]
    pub fn content(&self) -> String {
        match &self.system {
            Some(system) => format!("{}\n{}", normalize(system), normalize(&self.prompt)),
            None => normalize(&self.prompt),
        }
    }

    /// Computes the idempotency fingerprint of this request.
    ///
    /// Whitespace runs are collapsed and the temperature is rounded to two
    /// decimals before hashing, so cosmetically different requests share a key.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let mut field = |label: &str, value: &str| {
            hasher.update(label.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        };

        field("prompt", &normalize(&self.prompt));
        field("system", &self.system.as_deref().map(normalize).unwrap_or_default());
        field("model", self.model_hint.as_deref().unwrap_or(""));
        field("max_tokens", &self.max_tokens.to_string());
        field("temperature", &format!("{:.2}", self.temperature));
        field("stream", if self.stream { "1" } else { "0" });

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Returns true when the same request may safely be answered from cache
    /// by a similar (not identical) entry.
    #[must_use]
    pub fn is_idempotent(&self, max_temperature: f32) -> bool {
        !self.stream && self.temperature <= max_temperature
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,

    /// Number of tokens in the completion.
    pub completion_tokens: u32,

    /// Total number of tokens used.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Creates usage from prompt and completion counts.
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }
}

/// The response to a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The generated text.
    pub text: String,

    /// Token usage, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Name of the provider that served the request.
    pub provider: String,

    /// Model that produced the text, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Observed latency in milliseconds.
    pub latency_ms: u64,
}

/// One piece of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text appended by this chunk.
    pub delta: String,

    /// Set on the final chunk.
    pub done: bool,

    /// Usage, usually only present on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Result of a provider health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the provider answered the probe successfully.
    pub healthy: bool,

    /// Probe round-trip latency in milliseconds.
    pub latency_ms: u64,

    /// Optional detail (error text on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthStatus {
    /// A healthy probe result.
    #[must_use]
    pub fn healthy(latency_ms: u64) -> Self {
        Self { healthy: true, latency_ms, message: None }
    }

    /// An unhealthy probe result.
    pub fn unhealthy(latency_ms: u64, message: impl Into<String>) -> Self {
        Self { healthy: false, latency_ms, message: Some(message.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_whitespace_noise() {
        let a = CompletionRequest::new("Summarize   the\nrepository");
        let b = CompletionRequest::new("  Summarize the repository ");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_timeout() {
        let a = CompletionRequest::new("hello").with_timeout_ms(5);
        let b = CompletionRequest::new("hello").with_timeout_ms(50_000);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_parameters() {
        let base = CompletionRequest::new("hello");
        assert_ne!(base.fingerprint(), base.clone().with_temperature(0.9).fingerprint());
        assert_ne!(base.fingerprint(), base.clone().with_max_tokens(8).fingerprint());
        assert_ne!(base.fingerprint(), base.clone().with_stream(true).fingerprint());
        assert_ne!(base.fingerprint(), base.clone().with_system("be terse").fingerprint());
        assert_ne!(base.fingerprint(), base.clone().with_model_hint("gpt-4o").fingerprint());
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = CompletionRequest::new("hello").fingerprint();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_is_idempotent() {
        let req = CompletionRequest::new("x").with_temperature(0.2);
        assert!(req.is_idempotent(0.3));
        assert!(!req.clone().with_temperature(0.8).is_idempotent(0.3));
        assert!(!req.with_stream(true).is_idempotent(0.3));
    }

    #[test]
    fn test_temperature_is_clamped() {
        let req = CompletionRequest::new("x").with_temperature(5.0);
        assert!((req.temperature - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
