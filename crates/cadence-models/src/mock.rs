//! Mock provider for testing and demonstration.

use async_trait::async_trait;
use cadence_abstraction::{
    CompletionRequest, CompletionResponse, HealthStatus, ProviderAdapter, ProviderError,
    TokenUsage,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Responder = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;

/// A scripted provider.
///
/// Replies are resolved in order: the custom responder if one is set, then the
/// first rule whose needle occurs in the prompt, then an echo of the prompt's
/// first line. A configured failure overrides all of them.
pub struct MockProvider {
    name: String,
    model: String,
    latency: Duration,
    rules: Vec<(String, String)>,
    responder: Option<Arc<Responder>>,
    failure: Mutex<Option<ProviderError>>,
    healthy: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .field("latency", &self.latency)
            .field("rules", &self.rules.len())
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Creates a new echoing `MockProvider` with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            model: format!("{name}-mock"),
            name,
            latency: Duration::ZERO,
            rules: Vec::new(),
            responder: None,
            failure: Mutex::new(None),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Creates a provider whose every call fails with `error`.
    pub fn failing(name: impl Into<String>, error: ProviderError) -> Self {
        Self::new(name).with_failure(error)
    }

    /// Sets the simulated call latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the model name reported in responses.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Replies with `reply` whenever the prompt contains `needle`.
    #[must_use]
    pub fn with_rule(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), reply.into()));
        self
    }

    /// Uses a closure to produce replies.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Makes every call fail with `error`.
    #[must_use]
    pub fn with_failure(self, error: ProviderError) -> Self {
        self.set_failure(Some(error));
        self
    }

    /// Switches the failure mode at runtime; `None` restores normal replies.
    pub fn set_failure(&self, error: Option<ProviderError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Sets the result reported by `health_check`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `complete` calls received so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in progress at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        if let Some(error) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(error);
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        if let Some((_, reply)) = self.rules.iter().find(|(needle, _)| request.prompt.contains(needle))
        {
            return Ok(reply.clone());
        }
        let first_line = request.prompt.lines().next().unwrap_or_default();
        Ok(format!("Mock response from {}: {}", self.name, first_line))
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        debug!(provider = %self.name, prompt_len = request.prompt.len(), "MockProvider completing");

        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let text = self.reply_for(request)?;
        let prompt_tokens = count_tokens(&request.prompt);
        let completion_tokens = count_tokens(&text);
        Ok(CompletionResponse {
            text,
            usage: Some(TokenUsage::new(prompt_tokens, completion_tokens)),
            provider: self.name.clone(),
            model: Some(request.model_hint.clone().unwrap_or_else(|| self.model.clone())),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn health_check(&self) -> HealthStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::healthy(self.latency.as_millis() as u64)
        } else {
            HealthStatus::unhealthy(self.latency.as_millis() as u64, "mock marked unhealthy")
        }
    }
}

/// Decrements the in-flight counter even when the call future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rough whitespace token count used for mock usage figures.
fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}
