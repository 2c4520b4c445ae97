//! Shared helpers for orchestrator integration tests.

#![allow(dead_code)]

use cadence_abstraction::{ProviderAdapter, ProviderError};
use cadence_models::{MockProvider, ProviderConfig, ProviderKind};
use cadence_orchestrator::{
    ErrorRecoveryManager, LoadBalancer, Orchestrator, OrchestratorConfig, RecoveryConfig,
};
use std::sync::Arc;

/// A config listing `names` as mock providers, with short backoffs.
pub fn mock_config(names: &[&str]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::with_providers(
        names.iter().map(|name| ProviderConfig::new(*name, ProviderKind::Mock)).collect(),
    );
    config.recovery = RecoveryConfig { backoff_base_ms: 10, backoff_max_ms: 80, ..config.recovery };
    config
}

/// Builds an orchestrator over the given mocks.
pub fn orchestrator(config: OrchestratorConfig, mocks: &[Arc<MockProvider>]) -> Orchestrator {
    let adapters: Vec<Arc<dyn ProviderAdapter>> =
        mocks.iter().map(|m| Arc::clone(m) as Arc<dyn ProviderAdapter>).collect();
    Orchestrator::with_adapters(config, adapters).expect("valid test configuration")
}

/// A fresh per-run balancer over the orchestrator's registry, with its cache.
pub fn balancer(orchestrator: &Orchestrator) -> LoadBalancer {
    let recovery = Arc::new(ErrorRecoveryManager::new(orchestrator.config().recovery));
    let balancer = LoadBalancer::new(Arc::clone(orchestrator.registry()), recovery);
    match orchestrator.cache() {
        Some(cache) => balancer.with_cache(Arc::clone(cache)),
        None => balancer,
    }
}

/// A mock that scripts the Decomposer and answers everything else with a passing verdict.
pub fn scripted(name: &str) -> MockProvider {
    MockProvider::new(name).with_responder(|req| {
        let first = req.prompt.lines().next().unwrap_or_default();
        Ok(if first.starts_with("Decomposer") {
            "Work items:\n- parser\n- evaluator\n- cli".to_string()
        } else {
            format!("{first}\nVERDICT: PASS")
        })
    })
}

pub fn unavailable(provider: &str) -> ProviderError {
    ProviderError::Unavailable { provider: provider.to_string(), message: "connection refused".to_string() }
}
