//! Orchestration core for Cadence.
//!
//! An `Orchestrator` owns the long-lived pieces (provider registry, response
//! cache, role registry, workflow definition) and builds the per-run pieces
//! (load balancer, recovery manager, coordinator, state machine) each time a
//! workflow starts. Nothing here is process-global.
//!
//! ```no_run
//! use cadence_orchestrator::{Orchestrator, OrchestratorConfig, WorkflowOptions};
//! use cadence_models::{ProviderConfig, ProviderKind};
//!
//! # async fn demo() -> cadence_orchestrator::Result<()> {
//! let config = OrchestratorConfig::with_providers(vec![ProviderConfig::new("mock", ProviderKind::Mock)]);
//! let orchestrator = Orchestrator::new(config)?;
//! let run = orchestrator.start_workflow("Build a rate limiter", WorkflowOptions::default()).await?;
//! println!("{:?}", run.status);
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod error;
pub mod evidence;
pub mod providers;
pub mod recovery;
pub mod workflow;

pub use agents::{AgentRole, RoleHandler, RoleRegistry, StandardRoleHandler};
pub use config::{
    CoordinatorConfig, HealthConfig, OrchestratorConfig, RecoveryConfig, ScoringWeights,
    WorkflowConfig, WorkflowOptions,
};
pub use coordinator::{PhaseContext, StreamCoordinator};
pub use dag::{DagError, Subtask, SubtaskGraph};
pub use error::{
    ConfigurationError, DispatchError, OrchestrationError, PhaseError, Result, SubtaskError,
    WorkflowError,
};
pub use evidence::{Evidence, EvidenceKind};
pub use providers::{LoadBalancer, ProviderRegistry};
pub use recovery::{ErrorRecoveryManager, FailureCategory, RecoveryAction, RecoveryStats};
pub use workflow::{
    ChannelObserver, NoopObserver, PhaseResult, PhaseStateMachine, PhaseStatus, PhaseTransition,
    RunStatus, TracingObserver, WorkflowDefinition, WorkflowObserver, WorkflowRun,
};

use cadence_abstraction::{HealthStatus, ProviderAdapter};
use cadence_models::{HashingEmbedder, ResponseCache};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entry point for running workflows.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<ResponseCache>>,
    roles: Arc<RoleRegistry>,
    definition: Arc<WorkflowDefinition>,
    observer: Arc<dyn WorkflowObserver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.registry.len())
            .field("cache", &self.cache.is_some())
            .field("roles", &self.roles)
            .field("phases", &self.definition.phases.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator whose adapters come from `ProviderFactory`.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Configuration` before any dispatch if the
    /// configuration is invalid.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(&config)?;
        Ok(Self::assemble(config, registry)?)
    }

    /// Builds an orchestrator over caller-supplied adapters, matched to the
    /// configured providers by name.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Configuration` if the configuration is
    /// invalid or the adapters do not match it.
    pub fn with_adapters(
        config: OrchestratorConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Result<Self> {
        let registry = ProviderRegistry::with_adapters(&config, adapters)?;
        Ok(Self::assemble(config, registry)?)
    }

    fn assemble(
        config: OrchestratorConfig,
        registry: ProviderRegistry,
    ) -> std::result::Result<Self, ConfigurationError> {
        let cache = if config.cache.enabled {
            let mut cache = ResponseCache::new(config.cache.clone())?;
            if config.cache.similarity_enabled {
                cache = cache.with_embedder(Arc::new(HashingEmbedder::default()));
            }
            Some(Arc::new(cache))
        } else {
            None
        };

        Ok(Self {
            config,
            registry: Arc::new(registry),
            cache,
            roles: Arc::new(RoleRegistry::standard()),
            definition: Arc::new(WorkflowDefinition::unified()),
            observer: Arc::new(TracingObserver),
        })
    }

    /// Sets the phase-transition observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the role handlers.
    #[must_use]
    pub fn with_roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = Arc::new(roles);
        self
    }

    /// Replaces the workflow definition.
    ///
    /// # Errors
    /// Returns `ConfigurationError::InvalidWorkflow` if the definition does not validate.
    pub fn with_definition(mut self, definition: WorkflowDefinition) -> Result<Self> {
        definition.validate()?;
        self.definition = Arc::new(definition);
        Ok(self)
    }

    /// Shares an existing cache instead of the one built from configuration.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The provider registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The response cache, if caching is enabled.
    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// The configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The workflow definition runs follow.
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Runs a workflow to completion.
    ///
    /// Workflow failures are reported through the returned run's status and
    /// error; `Err` is only returned for invalid options.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Configuration` for invalid options or an
    /// unknown provider preference.
    pub async fn start_workflow(&self, prompt: &str, options: WorkflowOptions) -> Result<WorkflowRun> {
        self.start_workflow_with_cancel(prompt, options, CancellationToken::new()).await
    }

    /// Runs a workflow that stops early when `cancel` fires.
    ///
    /// # Errors
    /// See [`Orchestrator::start_workflow`].
    pub async fn start_workflow_with_cancel(
        &self,
        prompt: &str,
        options: WorkflowOptions,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        options.validate()?;

        let recovery = Arc::new(ErrorRecoveryManager::new(self.config.recovery));
        let mut balancer = LoadBalancer::new(Arc::clone(&self.registry), Arc::clone(&recovery));
        if let Some(cache) = &self.cache {
            balancer = balancer.with_cache(Arc::clone(cache));
        }
        if let Some(preference) = &options.provider_preference {
            balancer = balancer.with_preference(preference)?;
        }
        let balancer = Arc::new(balancer);

        let max_parallel =
            options.max_parallel_agents.unwrap_or(self.config.coordinator.max_parallel_agents);
        let max_iterations = options.max_iterations.unwrap_or(self.config.workflow.max_iterations);
        let coordinator =
            StreamCoordinator::new(Arc::clone(&self.roles), Arc::clone(&balancer), self.config.coordinator)
                .with_max_parallel_agents(max_parallel);
        let machine = PhaseStateMachine::new(
            Arc::clone(&self.definition),
            coordinator,
            recovery,
            Arc::clone(&self.observer),
            max_iterations,
        );

        info!(max_parallel, max_iterations, preference = ?options.provider_preference, "Starting workflow");
        let probe_cancel = cancel.child_token();
        let probe = balancer.spawn_health_probe(self.config.health.probe_interval(), probe_cancel.clone());

        let run = machine.run(prompt, &cancel).await;

        probe_cancel.cancel();
        if let Err(e) = probe.await {
            warn!(error = %e, "Health probe task ended abnormally");
        }
        Ok(run)
    }

    /// Starts the periodic cache expiry sweep. Returns `None` when caching is disabled.
    pub fn spawn_cache_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.cache.as_ref().map(|cache| cache.spawn_sweeper(cancel))
    }

    /// Health-checks every provider without changing its recorded health.
    pub async fn check_providers(&self) -> Vec<(String, HealthStatus)> {
        let checks = self.registry.providers().iter().map(|provider| async move {
            let status = provider.adapter().health_check().await;
            debug!(provider = %provider.name(), healthy = status.healthy, "Health check");
            (provider.name().to_string(), status)
        });
        futures::future::join_all(checks).await
    }
}
