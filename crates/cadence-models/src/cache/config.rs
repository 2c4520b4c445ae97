//! Configuration for the response cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the response cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether response caching is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds an entry stays valid after it is stored (default: 3600 = 1 hour).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of entries before LRU eviction (default: 1000).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How often the expiry sweep runs in seconds (default: 300 = 5 minutes).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Whether similarity lookup is enabled (opt-in).
    #[serde(default)]
    pub similarity_enabled: bool,

    /// Minimum cosine similarity for a similar hit (default: 0.8).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Requests above this temperature never use or feed similarity lookup (default: 0.3).
    #[serde(default = "default_similarity_max_temperature")]
    pub similarity_max_temperature: f32,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_max_entries() -> usize {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_similarity_threshold() -> f32 {
    0.8
}

fn default_similarity_max_temperature() -> f32 {
    0.3
}

/// Errors that can occur during cache configuration validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheConfigError {
    /// Invalid TTL (must be > 0).
    #[error("Invalid cache TTL: must be greater than 0")]
    InvalidTtl,

    /// Invalid max entries (must be > 0).
    #[error("Invalid max cache entries: must be greater than 0")]
    InvalidMaxEntries,

    /// Invalid sweep interval (must be > 0).
    #[error("Invalid sweep interval: must be greater than 0")]
    InvalidSweepInterval,

    /// Similarity threshold outside (0, 1].
    #[error("Invalid similarity threshold {0}: must be in (0, 1]")]
    InvalidSimilarityThreshold(f32),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            similarity_enabled: false,
            similarity_threshold: default_similarity_threshold(),
            similarity_max_temperature: default_similarity_max_temperature(),
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.ttl_secs == 0 {
            return Err(CacheConfigError::InvalidTtl);
        }

        if self.max_entries == 0 {
            return Err(CacheConfigError::InvalidMaxEntries);
        }

        if self.sweep_interval_secs == 0 {
            return Err(CacheConfigError::InvalidSweepInterval);
        }

        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(CacheConfigError::InvalidSimilarityThreshold(self.similarity_threshold));
        }

        Ok(())
    }

    /// Get the TTL as a Duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Get the sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ttl_secs, 3600);
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.sweep_interval_secs, 300);
        assert!(!config.similarity_enabled);
        assert!((config.similarity_threshold - 0.8).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_validation_invalid_ttl() {
        let config = CacheConfig { ttl_secs: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidTtl));
    }

    #[test]
    fn test_cache_config_validation_invalid_max_entries() {
        let config = CacheConfig { max_entries: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidMaxEntries));
    }

    #[test]
    fn test_cache_config_validation_invalid_sweep_interval() {
        let config = CacheConfig { sweep_interval_secs: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidSweepInterval));
    }

    #[test]
    fn test_cache_config_validation_invalid_threshold() {
        let config = CacheConfig { similarity_threshold: 1.5, ..CacheConfig::default() };
        assert!(matches!(
            config.validate(),
            Err(CacheConfigError::InvalidSimilarityThreshold(_))
        ));
    }

    #[test]
    fn test_cache_config_from_partial_toml_like_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"ttl_secs": 60, "similarity_enabled": true}"#).unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(60));
        assert!(config.similarity_enabled);
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    }
}
