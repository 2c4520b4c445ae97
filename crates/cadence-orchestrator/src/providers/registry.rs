//! Registry of configured providers.

use super::descriptor::{HealthSnapshot, ProviderDescriptor, ProviderStats};
use crate::config::{HealthConfig, OrchestratorConfig, ScoringWeights};
use crate::error::ConfigurationError;
use cadence_abstraction::ProviderAdapter;
use cadence_models::ProviderFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// All configured providers in declaration order.
///
/// Built once per process and shared across runs; no global instance exists.
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<Arc<ProviderDescriptor>>,
    index: HashMap<String, usize>,
    weights: ScoringWeights,
    health: HealthConfig,
}

impl ProviderRegistry {
    /// Builds adapters for every configured provider through `ProviderFactory`.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if validation fails or an adapter cannot be built.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let mut adapters = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            let adapter = ProviderFactory::create(provider).map_err(|e| {
                ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            adapters.push(adapter);
        }
        Self::with_adapters(config, adapters)
    }

    /// Pairs configured providers with caller-supplied adapters by name.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if validation fails, an adapter has no
    /// matching provider entry, or a provider has no adapter.
    pub fn with_adapters(
        config: &OrchestratorConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let mut by_name: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        for adapter in adapters {
            let name = adapter.name().to_string();
            if !config.providers.iter().any(|p| p.name == name) {
                return Err(ConfigurationError::UnknownProvider(name));
            }
            by_name.insert(name, adapter);
        }

        let mut providers = Vec::with_capacity(config.providers.len());
        let mut index = HashMap::with_capacity(config.providers.len());
        for provider in &config.providers {
            let adapter = by_name.remove(&provider.name).ok_or_else(|| {
                ConfigurationError::InvalidProvider {
                    provider: provider.name.clone(),
                    reason: "no adapter supplied".to_string(),
                }
            })?;
            debug!(provider = %provider.name, kind = ?provider.kind, "Registering provider");
            index.insert(provider.name.clone(), providers.len());
            providers.push(Arc::new(ProviderDescriptor::new(provider.clone(), adapter)));
        }

        info!(count = providers.len(), "Provider registry ready");
        Ok(Self { providers, index, weights: config.scoring, health: config.health })
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Looks up a provider by name.
    pub fn get(&self, name: &str) -> Option<&Arc<ProviderDescriptor>> {
        self.index.get(name).map(|&i| &self.providers[i])
    }

    /// Position of a provider in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// All providers in declaration order.
    pub fn providers(&self) -> &[Arc<ProviderDescriptor>] {
        &self.providers
    }

    /// Scoring weights.
    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Health settings.
    pub fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    /// Current snapshots keyed by name, in declaration order.
    pub fn snapshots(&self) -> Vec<(String, HealthSnapshot)> {
        self.providers.iter().map(|p| (p.name().to_string(), p.snapshot())).collect()
    }

    /// Cumulative usage per provider.
    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers.iter().map(|p| p.stats()).collect()
    }

    /// Resolves provider names to positions.
    ///
    /// # Errors
    /// Returns `ConfigurationError::UnknownProvider` for an unregistered name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<usize>, ConfigurationError> {
        names
            .iter()
            .map(|name| {
                self.position(name).ok_or_else(|| ConfigurationError::UnknownProvider(name.clone()))
            })
            .collect()
    }
}
