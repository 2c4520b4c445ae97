//! Provider error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when calling an LLM provider.
///
/// The variants line up with the recovery categories used by the orchestrator:
/// `Timeout`/`Network` are transient, `RateLimited` triggers immediate failover,
/// `Authentication` disables the provider for the rest of a run and
/// `Unavailable` marks it unhealthy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// The call did not complete within the request timeout.
    #[error("Provider '{provider}' timed out after {after_ms}ms")]
    Timeout {
        /// The provider name.
        provider: String,
        /// The timeout that elapsed, in milliseconds.
        after_ms: u64,
    },

    /// A transport-level failure (connection reset, DNS, 5xx gateway errors).
    #[error("Network error from '{provider}': {message}")]
    Network {
        /// The provider name.
        provider: String,
        /// Error detail.
        message: String,
    },

    /// The provider rejected the call because of rate limiting or quota.
    #[error("Provider '{provider}' rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited {
        /// The provider name.
        provider: String,
        /// Optional server-provided backoff hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// Credentials were missing or rejected.
    #[error("Authentication failed for '{provider}': {message}")]
    Authentication {
        /// The provider name.
        provider: String,
        /// Error detail.
        message: String,
    },

    /// The provider reported itself down or unreachable.
    #[error("Provider '{provider}' unavailable: {message}")]
    Unavailable {
        /// The provider name.
        provider: String,
        /// Error detail.
        message: String,
    },

    /// The provider answered but the payload could not be used.
    #[error("Invalid response from '{provider}': {message}")]
    InvalidResponse {
        /// The provider name.
        provider: String,
        /// Error detail.
        message: String,
    },

    /// The operation is not supported by this provider.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Other unexpected errors.
    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Returns the provider this error originated from, when known.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Timeout { provider, .. }
            | Self::Network { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Authentication { provider, .. }
            | Self::Unavailable { provider, .. }
            | Self::InvalidResponse { provider, .. } => Some(provider),
            Self::Unsupported(_) | Self::Other(_) => None,
        }
    }

    /// Maps a non-success HTTP status to the matching error variant.
    ///
    /// # Arguments
    /// * `provider` - The provider name
    /// * `status` - The HTTP status code
    /// * `body` - The response body, used as the error message
    #[must_use]
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", body.trim())
        };

        match status {
            401 | 403 => Self::Authentication { provider, message },
            402 | 429 => Self::RateLimited { provider, retry_after_ms: None },
            503 => Self::Unavailable { provider, message },
            408 | 500..=599 => Self::Network { provider, message },
            _ => Self::InvalidResponse { provider, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ProviderError::from_status("openai", 401, "bad key"),
            ProviderError::Authentication { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("openai", 403, ""),
            ProviderError::Authentication { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("openai", 429, "slow down"),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("openai", 503, "maintenance"),
            ProviderError::Unavailable { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("openai", 502, ""),
            ProviderError::Network { .. }
        ));
        assert!(matches!(
            ProviderError::from_status("openai", 400, "bad request"),
            ProviderError::InvalidResponse { .. }
        ));
    }

    #[test]
    fn test_provider_accessor() {
        let err = ProviderError::Timeout { provider: "a".to_string(), after_ms: 10 };
        assert_eq!(err.provider(), Some("a"));
        assert_eq!(ProviderError::Other("x".to_string()).provider(), None);
    }

    #[test]
    fn test_rate_limited_display() {
        let with_hint =
            ProviderError::RateLimited { provider: "gemini".to_string(), retry_after_ms: Some(500) };
        assert!(with_hint.to_string().contains("retry after 500ms"));

        let without_hint =
            ProviderError::RateLimited { provider: "gemini".to_string(), retry_after_ms: None };
        assert_eq!(without_hint.to_string(), "Provider 'gemini' rate limited");
    }

    #[test]
    fn test_status_message_includes_body() {
        let err = ProviderError::from_status("claude", 500, "  boom ");
        assert_eq!(err.to_string(), "Network error from 'claude': HTTP 500: boom");
    }
}
