//! Provider factory for creating adapter instances from configuration.
//!
//! This module builds `ProviderAdapter` trait objects from `ProviderConfig`,
//! handling API key loading from environment variables.

use crate::openai::{DEFAULT_BASE_URL, OpenAiCompatibleProvider};
use crate::mock::MockProvider;
use cadence_abstraction::{DEFAULT_TIMEOUT_MS, ProviderAdapter, ProviderError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Provider kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Scripted in-process provider.
    Mock,
    /// Any endpoint speaking the OpenAI chat completions format.
    OpenAiCompatible,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "openai" | "openai_compatible" | "openai-compatible" | "universal" | "local" => {
                Ok(Self::OpenAiCompatible)
            }
            other => Err(format!("unknown provider kind '{other}'")),
        }
    }
}

/// A canned mock reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockReply {
    /// Substring the prompt must contain.
    pub contains: String,
    /// Text returned when it does.
    pub reply: String,
}

/// Settings for `ProviderKind::Mock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockSettings {
    /// Simulated latency per call.
    #[serde(default)]
    pub latency_ms: u64,
    /// Makes every call fail: `timeout`, `rate_limited`, `auth`, `unavailable`.
    #[serde(default)]
    pub fail_with: Option<String>,
    /// Rules checked in order.
    #[serde(default)]
    pub replies: Vec<MockReply>,
}

/// Static configuration of one provider. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name.
    pub name: String,
    /// Adapter kind.
    pub kind: ProviderKind,
    /// Default model ID.
    #[serde(default)]
    pub model: String,
    /// Base URL for HTTP providers.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Maximum concurrent calls used for the load term.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Local call budget per rolling minute.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Relative cost; higher is more expensive.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    /// Capability tags (e.g. "code", "embeddings").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Per-call timeout applied when the request has none of its own.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Mock behavior; ignored by other kinds.
    #[serde(default)]
    pub mock: Option<MockSettings>,
}

fn default_max_concurrency() -> u32 {
    8
}

fn default_cost_weight() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ProviderConfig {
    /// Creates a config with defaults for everything but name and kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            model: String::new(),
            base_url: None,
            api_key_env: None,
            max_concurrency: default_max_concurrency(),
            rate_limit_per_minute: None,
            cost_weight: default_cost_weight(),
            capabilities: Vec::new(),
            timeout_ms: default_timeout_ms(),
            mock: None,
        }
    }

    /// Sets the model ID.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the cost weight.
    #[must_use]
    pub fn with_cost_weight(mut self, cost_weight: f64) -> Self {
        self.cost_weight = cost_weight;
        self
    }

    /// Sets the maximum concurrency.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the per-minute rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    /// Sets the mock settings.
    #[must_use]
    pub fn with_mock(mut self, mock: MockSettings) -> Self {
        self.mock = Some(mock);
        self
    }

    /// Returns whether the provider declares the capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Factory for creating provider adapters.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Creates an adapter from configuration.
    ///
    /// # Errors
    /// Returns `ProviderError::Authentication` if the configured API key
    /// variable is unset, or `ProviderError::Other` for an unknown mock
    /// failure mode.
    pub fn create(config: &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        debug!(provider = %config.name, kind = ?config.kind, model = %config.model, "Creating provider");

        match config.kind {
            ProviderKind::Mock => Ok(Arc::new(Self::create_mock(config)?)),
            ProviderKind::OpenAiCompatible => {
                let model = if config.model.is_empty() { "gpt-4o-mini" } else { &config.model };
                let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
                let mut provider = OpenAiCompatibleProvider::new(&config.name, model, base_url);
                if let Some(var) = &config.api_key_env {
                    let key = std::env::var(var).map_err(|_| {
                        error!(provider = %config.name, env = %var, "API key environment variable not set");
                        ProviderError::Authentication {
                            provider: config.name.clone(),
                            message: format!("environment variable {var} is not set"),
                        }
                    })?;
                    provider = provider.with_api_key(key);
                }
                Ok(Arc::new(provider))
            }
        }
    }

    fn create_mock(config: &ProviderConfig) -> Result<MockProvider, ProviderError> {
        let settings = config.mock.clone().unwrap_or_default();
        let mut provider = MockProvider::new(&config.name)
            .with_latency(Duration::from_millis(settings.latency_ms));
        if !config.model.is_empty() {
            provider = provider.with_model(&config.model);
        }
        for rule in settings.replies {
            provider = provider.with_rule(rule.contains, rule.reply);
        }
        if let Some(mode) = settings.fail_with.as_deref() {
            provider = provider.with_failure(mock_failure(&config.name, mode, config.timeout_ms)?);
        }
        Ok(provider)
    }
}

fn mock_failure(provider: &str, mode: &str, timeout_ms: u64) -> Result<ProviderError, ProviderError> {
    let provider = provider.to_string();
    match mode {
        "timeout" => Ok(ProviderError::Timeout { provider, after_ms: timeout_ms }),
        "network" => Ok(ProviderError::Network { provider, message: "simulated".to_string() }),
        "rate_limited" => Ok(ProviderError::RateLimited { provider, retry_after_ms: None }),
        "auth" | "authentication" => {
            Ok(ProviderError::Authentication { provider, message: "simulated".to_string() })
        }
        "unavailable" | "down" => {
            Ok(ProviderError::Unavailable { provider, message: "simulated".to_string() })
        }
        other => Err(ProviderError::Other(format!(
            "unknown mock failure mode '{other}' for provider '{provider}'"
        ))),
    }
}
