//! Health-aware provider selection with failover.
//!
//! A `LoadBalancer` is created for each workflow run. It shares the
//! long-lived registry and cache but owns the run's recovery state, so a
//! provider revoked for bad credentials stays revoked only for that run.

use super::descriptor::ProviderDescriptor;
use super::registry::ProviderRegistry;
use super::scoring::{Candidate, select_provider};
use crate::error::{ConfigurationError, DispatchError};
use crate::evidence::{Evidence, EvidenceKind};
use crate::recovery::{ErrorRecoveryManager, RecoveryAction};
use cadence_abstraction::{CompletionRequest, CompletionResponse, ProviderError};
use cadence_models::{HitKind, ResponseCache};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum AttemptFailure {
    Provider(ProviderError),
    Cancelled,
}

/// Dispatches completion requests to the best available provider.
pub struct LoadBalancer {
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<ResponseCache>>,
    recovery: Arc<ErrorRecoveryManager>,
    allowed: Option<Vec<bool>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("providers", &self.registry.len())
            .field("cache", &self.cache.is_some())
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    /// Creates a balancer over every registered provider.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, recovery: Arc<ErrorRecoveryManager>) -> Self {
        Self { registry, cache: None, recovery, allowed: None }
    }

    /// Consults `cache` before provider selection.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Restricts selection to the named providers.
    ///
    /// # Errors
    /// Returns `ConfigurationError::UnknownProvider` for an unregistered name.
    pub fn with_preference(mut self, names: &[String]) -> Result<Self, ConfigurationError> {
        let positions = self.registry.resolve(names)?;
        let mut allowed = vec![false; self.registry.len()];
        for position in positions {
            allowed[position] = true;
        }
        self.allowed = Some(allowed);
        Ok(self)
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The run's recovery manager.
    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    /// The provider `dispatch` would try first right now.
    pub fn select(&self) -> Option<&Arc<ProviderDescriptor>> {
        let tried = vec![false; self.registry.len()];
        select_provider(&self.candidates(&tried), self.registry.weights())
            .map(|i| &self.registry.providers()[i])
    }

    fn candidates(&self, tried: &[bool]) -> Vec<Candidate> {
        self.registry
            .providers()
            .iter()
            .enumerate()
            .map(|(i, provider)| {
                let permitted = self.allowed.as_ref().is_none_or(|allowed| allowed[i]);
                Candidate {
                    snapshot: provider.snapshot(),
                    max_concurrency: provider.config().max_concurrency,
                    cost_weight: provider.config().cost_weight,
                    eligible: permitted
                        && !tried[i]
                        && !self.recovery.is_revoked(provider.name())
                        && !provider.is_rate_limited(),
                }
            })
            .collect()
    }

    /// Dispatches a request, discarding evidence.
    ///
    /// # Errors
    /// See [`LoadBalancer::dispatch_with`].
    pub async fn dispatch(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, DispatchError> {
        let mut evidence = Vec::new();
        self.dispatch_with(request, &CancellationToken::new(), &mut evidence).await
    }

    /// Dispatches a request, appending every recovery action to `evidence`.
    ///
    /// Non-streaming requests are answered from the cache when possible; a hit
    /// makes no provider call and leaves health untouched. Otherwise the best
    /// provider is called, failing over to the next-best one until every
    /// eligible provider has been tried once.
    ///
    /// # Errors
    /// Returns `DispatchError::AllProvidersFailed` when every tried provider
    /// failed, `NoEligibleProviders` when none could be tried, and
    /// `Cancelled` when `cancel` fires.
    pub async fn dispatch_with(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        evidence: &mut Vec<Evidence>,
    ) -> Result<CompletionResponse, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let cacheable = !request.stream;
        if cacheable {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.lookup_hit(request).await {
                    let detail = match hit.kind {
                        HitKind::Exact => "exact cache hit".to_string(),
                        HitKind::Similar { similarity } => {
                            format!("similarity cache hit ({similarity:.3})")
                        }
                    };
                    evidence.push(
                        Evidence::new(EvidenceKind::CacheHit, detail)
                            .with_provider(hit.response.provider.clone()),
                    );
                    return Ok(hit.response);
                }
            }
        }

        let mut tried = vec![false; self.registry.len()];
        let mut attempts = 0_usize;
        let mut last_error: Option<ProviderError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let Some(index) = select_provider(&self.candidates(&tried), self.registry.weights())
            else {
                break;
            };
            tried[index] = true;
            attempts += 1;
            let provider = &self.registry.providers()[index];

            if let Some(previous) = &last_error {
                info!(to = %provider.name(), error = %previous, "Failing over");
                evidence.push(
                    Evidence::new(EvidenceKind::Failover, format!("failover after: {previous}"))
                        .with_provider(provider.name()),
                );
            }

            match self.attempt(provider, request, cancel, evidence).await {
                Ok(response) => {
                    if cacheable {
                        if let Some(cache) = &self.cache {
                            cache.store(request, response.clone()).await;
                        }
                    }
                    return Ok(response);
                }
                Err(AttemptFailure::Cancelled) => return Err(DispatchError::Cancelled),
                Err(AttemptFailure::Provider(error)) => last_error = Some(error),
            }
        }

        if attempts == 0 {
            warn!("No eligible providers for dispatch");
            Err(DispatchError::NoEligibleProviders)
        } else {
            warn!(attempts, "All providers failed");
            Err(DispatchError::AllProvidersFailed { attempts, last_error })
        }
    }

    /// Calls one provider, retrying it in place for transient failures.
    async fn attempt(
        &self,
        provider: &ProviderDescriptor,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        evidence: &mut Vec<Evidence>,
    ) -> Result<CompletionResponse, AttemptFailure> {
        let health = *self.registry.health_config();
        let timeout = Duration::from_millis(request.timeout_ms.min(provider.config().timeout_ms));
        let mut call_number = 0_u32;

        loop {
            call_number += 1;
            debug!(provider = %provider.name(), call_number, "Calling provider");

            let started = Instant::now();
            let outcome = {
                let _in_flight = provider.begin_call();
                tokio::select! {
                    () = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
                    result = tokio::time::timeout(timeout, call(provider, request)) => result,
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(Ok(response)) => {
                    provider.record_success(elapsed_ms, response.usage, health.ema_alpha);
                    evidence.push(
                        Evidence::new(
                            EvidenceKind::ProviderCall,
                            format!("completed in {elapsed_ms}ms"),
                        )
                        .with_provider(provider.name()),
                    );
                    return Ok(response);
                }
                Ok(Err(error)) => error,
                Err(_) => ProviderError::Timeout {
                    provider: provider.name().to_string(),
                    after_ms: timeout.as_millis() as u64,
                },
            };

            warn!(provider = %provider.name(), error = %error, call_number, "Provider call failed");
            evidence.push(
                Evidence::new(EvidenceKind::ProviderFailure, error.to_string())
                    .with_provider(provider.name()),
            );
            if provider.record_failure(health.ema_alpha, health.success_floor) {
                evidence.push(
                    Evidence::new(EvidenceKind::ProviderUnhealthy, "success rate below floor")
                        .with_provider(provider.name()),
                );
            }

            match self.recovery.on_provider_error(&error, call_number) {
                RecoveryAction::RetrySameProvider { delay } if provider.is_healthy() => {
                    evidence.push(
                        Evidence::new(
                            EvidenceKind::Retry,
                            format!("retry {} after {}ms", call_number + 1, delay.as_millis()),
                        )
                        .with_provider(provider.name()),
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::RetrySameProvider { .. } | RecoveryAction::Failover => {
                    return Err(AttemptFailure::Provider(error));
                }
                RecoveryAction::RevokeProvider => {
                    if self.recovery.revoke(provider.name()) {
                        evidence.push(
                            Evidence::new(EvidenceKind::ProviderRevoked, error.to_string())
                                .with_provider(provider.name()),
                        );
                    }
                    return Err(AttemptFailure::Provider(error));
                }
                RecoveryAction::MarkUnhealthy => {
                    if provider.mark_unhealthy() {
                        evidence.push(
                            Evidence::new(EvidenceKind::ProviderUnhealthy, error.to_string())
                                .with_provider(provider.name()),
                        );
                    }
                    return Err(AttemptFailure::Provider(error));
                }
            }
        }
    }

    /// Probes every unhealthy, non-revoked provider once.
    ///
    /// # Returns
    /// Names of providers that recovered.
    pub async fn probe_once(&self) -> Vec<String> {
        let targets: Vec<&Arc<ProviderDescriptor>> = self
            .registry
            .providers()
            .iter()
            .filter(|p| !p.is_healthy() && !self.recovery.is_revoked(p.name()))
            .collect();

        let results = futures::future::join_all(
            targets.iter().map(|p| async move { (p, p.adapter().health_check().await) }),
        )
        .await;

        let mut recovered = Vec::new();
        for (provider, status) in results {
            if status.healthy {
                provider.restore(status.latency_ms);
                recovered.push(provider.name().to_string());
            } else {
                debug!(
                    provider = %provider.name(),
                    message = status.message.as_deref().unwrap_or(""),
                    "Provider still unhealthy"
                );
            }
        }
        recovered
    }

    /// Spawns the periodic health probe; it stops when `cancel` fires.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let recovered = balancer.probe_once().await;
                        if !recovered.is_empty() {
                            info!(providers = ?recovered, "Health probe re-enabled providers");
                        }
                    }
                }
            }
            debug!("Health probe stopped");
        })
    }
}

/// Performs one call. Streaming requests are collected into one response.
async fn call(
    provider: &ProviderDescriptor,
    request: &CompletionRequest,
) -> Result<CompletionResponse, ProviderError> {
    if !request.stream {
        return provider.adapter().complete(request).await;
    }

    let started = Instant::now();
    let mut stream = provider.adapter().stream_complete(request).await?;
    let mut text = String::new();
    let mut usage = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        text.push_str(&chunk.delta);
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.done {
            break;
        }
    }

    Ok(CompletionResponse {
        text,
        usage,
        provider: provider.name().to_string(),
        model: request.model_hint.clone().or_else(|| Some(provider.config().model.clone())),
        latency_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use cadence_abstraction::ProviderAdapter;
    use cadence_models::{CacheConfig, MockProvider, ProviderConfig, ProviderKind};

    fn balancer(mocks: Vec<Arc<MockProvider>>) -> LoadBalancer {
        let config = OrchestratorConfig::with_providers(
            mocks.iter().map(|m| ProviderConfig::new(m.name(), ProviderKind::Mock)).collect(),
        );
        let adapters: Vec<Arc<dyn ProviderAdapter>> =
            mocks.into_iter().map(|m| m as Arc<dyn ProviderAdapter>).collect();
        let registry = Arc::new(ProviderRegistry::with_adapters(&config, adapters).unwrap());
        LoadBalancer::new(registry, Arc::new(ErrorRecoveryManager::new(config.recovery)))
    }

    #[tokio::test]
    async fn test_dispatch_uses_first_provider_on_tie() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        let lb = balancer(vec![a.clone(), b.clone()]);
        let response = lb.dispatch(&CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "a");
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_fails_over_without_retry() {
        let a = Arc::new(MockProvider::failing(
            "a",
            ProviderError::RateLimited { provider: "a".to_string(), retry_after_ms: None },
        ));
        let b = Arc::new(MockProvider::new("b"));
        let lb = balancer(vec![a.clone(), b.clone()]);

        let mut evidence = Vec::new();
        let response = lb
            .dispatch_with(&CompletionRequest::new("hi"), &CancellationToken::new(), &mut evidence)
            .await
            .unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 1);
        assert!(evidence.iter().any(|e| e.kind == EvidenceKind::Failover));
    }

    #[tokio::test]
    async fn test_authentication_revokes_for_run() {
        let a = Arc::new(MockProvider::failing(
            "a",
            ProviderError::Authentication { provider: "a".to_string(), message: "bad".to_string() },
        ));
        let b = Arc::new(MockProvider::new("b"));
        let lb = balancer(vec![a.clone(), b]);

        lb.dispatch(&CompletionRequest::new("one")).await.unwrap();
        lb.dispatch(&CompletionRequest::new("two")).await.unwrap();
        assert_eq!(a.calls(), 1);
        assert!(lb.recovery().is_revoked("a"));
    }

    #[tokio::test]
    async fn test_provider_down_marked_unhealthy() {
        let a = Arc::new(MockProvider::failing(
            "a",
            ProviderError::Unavailable { provider: "a".to_string(), message: "503".to_string() },
        ));
        let b = Arc::new(MockProvider::new("b"));
        let lb = balancer(vec![a, b]);

        lb.dispatch(&CompletionRequest::new("x")).await.unwrap();
        assert!(!lb.registry().get("a").unwrap().is_healthy());
        assert_eq!(lb.select().unwrap().name(), "b");
    }

    #[tokio::test]
    async fn test_preference_restricts_selection() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        let lb = balancer(vec![a.clone(), b]).with_preference(&["b".to_string()]).unwrap();
        let response = lb.dispatch(&CompletionRequest::new("x")).await.unwrap();
        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_preference_rejected() {
        let lb = balancer(vec![Arc::new(MockProvider::new("a"))]);
        assert_eq!(
            lb.with_preference(&["nope".to_string()]).unwrap_err(),
            ConfigurationError::UnknownProvider("nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_eligible_providers() {
        let a = Arc::new(MockProvider::new("a"));
        let lb = balancer(vec![a.clone()]);
        lb.registry().get("a").unwrap().mark_unhealthy();
        assert_eq!(
            lb.dispatch(&CompletionRequest::new("x")).await.unwrap_err(),
            DispatchError::NoEligibleProviders
        );
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let lb = balancer(vec![Arc::new(MockProvider::new("a"))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut evidence = Vec::new();
        let result = lb.dispatch_with(&CompletionRequest::new("x"), &cancel, &mut evidence).await;
        assert_eq!(result.unwrap_err(), DispatchError::Cancelled);
    }

    #[tokio::test]
    async fn test_streaming_collects_and_bypasses_cache() {
        let a = Arc::new(MockProvider::new("a"));
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()).unwrap());
        let lb = balancer(vec![a.clone()]).with_cache(cache.clone());

        let request = CompletionRequest::new("stream me").with_stream(true);
        let first = lb.dispatch(&request).await.unwrap();
        let second = lb.dispatch(&request).await.unwrap();
        assert_eq!(first.text, "Mock response from a: stream me");
        assert_eq!(second.text, first.text);
        assert_eq!(a.calls(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_probe_restores_unhealthy_provider() {
        let a = Arc::new(MockProvider::new("a"));
        let lb = balancer(vec![a.clone()]);
        let descriptor = lb.registry().get("a").unwrap().clone();
        descriptor.set_health(false, 0.2, 800.0);

        a.set_healthy(false);
        assert!(lb.probe_once().await.is_empty());
        assert!(!descriptor.is_healthy());

        a.set_healthy(true);
        assert_eq!(lb.probe_once().await, vec!["a".to_string()]);
        let snapshot = descriptor.snapshot();
        assert!(snapshot.healthy);
        assert!((snapshot.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_skips_revoked_provider() {
        let a = Arc::new(MockProvider::new("a"));
        let lb = balancer(vec![a]);
        lb.registry().get("a").unwrap().mark_unhealthy();
        lb.recovery().revoke("a");
        assert!(lb.probe_once().await.is_empty());
        assert!(!lb.registry().get("a").unwrap().is_healthy());
    }
}
