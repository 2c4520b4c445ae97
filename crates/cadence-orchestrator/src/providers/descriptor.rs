//! Live state of one registered provider.

use cadence_abstraction::{ProviderAdapter, TokenUsage};
use cadence_models::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time copy of a provider's health, used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Whether the provider may be selected.
    pub healthy: bool,
    /// Moving average of call latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Moving average of call success (0.0 to 1.0).
    pub success_rate: f64,
    /// Calls currently in progress.
    pub in_flight: u32,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self { healthy: true, avg_latency_ms: 0.0, success_rate: 1.0, in_flight: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    healthy: bool,
    avg_latency_ms: f64,
    success_rate: f64,
    samples: u64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self { healthy: true, avg_latency_ms: 0.0, success_rate: 1.0, samples: 0 }
    }
}

/// Cumulative usage of one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider name.
    pub name: String,
    /// Calls made.
    pub calls: u64,
    /// Calls that failed.
    pub failures: u64,
    /// Prompt tokens reported.
    pub prompt_tokens: u64,
    /// Completion tokens reported.
    pub completion_tokens: u64,
}

/// A registered provider: static configuration, adapter and live health.
///
/// Health figures sit behind a per-provider mutex so concurrent agents never
/// lose updates to the moving averages; the in-flight count is a plain atomic.
pub struct ProviderDescriptor {
    config: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
    health: Mutex<HealthState>,
    in_flight: AtomicU32,
    recent_calls: Mutex<VecDeque<Instant>>,
    calls: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.config.name)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProviderDescriptor {
    /// Creates a descriptor with a fresh, healthy snapshot.
    #[must_use]
    pub fn new(config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            config,
            adapter,
            health: Mutex::new(HealthState::default()),
            in_flight: AtomicU32::new(0),
            recent_calls: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        }
    }

    /// Provider name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Static configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The adapter.
    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    /// Copies the current health figures.
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = *self.health.lock().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            healthy: state.healthy,
            avg_latency_ms: state.avg_latency_ms,
            success_rate: state.success_rate,
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Whether the provider is currently selectable on health grounds.
    pub fn is_healthy(&self) -> bool {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).healthy
    }

    /// Overrides the health figures, e.g. when restoring persisted metrics.
    pub fn set_health(&self, healthy: bool, success_rate: f64, avg_latency_ms: f64) {
        let mut state = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        state.healthy = healthy;
        state.success_rate = success_rate.clamp(0.0, 1.0);
        state.avg_latency_ms = avg_latency_ms.max(0.0);
        state.samples = state.samples.max(1);
    }

    /// Folds a successful call into the moving averages.
    pub fn record_success(&self, latency_ms: u64, usage: Option<TokenUsage>, alpha: f64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.prompt_tokens.fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
            self.completion_tokens.fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);
        }

        let mut state = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        let latency = latency_ms as f64;
        state.avg_latency_ms = if state.samples == 0 {
            latency
        } else {
            alpha.mul_add(latency, (1.0 - alpha) * state.avg_latency_ms)
        };
        state.success_rate = alpha.mul_add(1.0, (1.0 - alpha) * state.success_rate);
        state.samples += 1;
    }

    /// Folds a failed call into the success average.
    ///
    /// Returns true when this failure took the provider below `floor` and
    /// marked it unhealthy.
    pub fn record_failure(&self, alpha: f64, floor: f64) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        state.success_rate *= 1.0 - alpha;
        state.samples += 1;
        if state.healthy && state.success_rate < floor {
            state.healthy = false;
            warn!(
                provider = %self.config.name,
                success_rate = state.success_rate,
                floor,
                "Provider success rate below floor, marking unhealthy"
            );
            return true;
        }
        false
    }

    /// Marks the provider unhealthy. Returns true if it was healthy before.
    pub fn mark_unhealthy(&self) -> bool {
        let mut state = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        let was_healthy = state.healthy;
        state.healthy = false;
        was_healthy
    }

    /// Re-enables the provider after a successful probe.
    pub fn restore(&self, probe_latency_ms: u64) {
        let mut state = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        state.healthy = true;
        state.success_rate = 1.0;
        state.avg_latency_ms = probe_latency_ms as f64;
        info!(provider = %self.config.name, latency_ms = probe_latency_ms, "Provider recovered");
    }

    /// Whether the local per-minute budget is spent.
    pub fn is_rate_limited(&self) -> bool {
        let Some(limit) = self.config.rate_limit_per_minute else {
            return false;
        };
        let mut calls = self.recent_calls.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut calls, Instant::now());
        calls.len() >= limit as usize
    }

    /// Marks a call as started; the guard marks it finished when dropped.
    pub fn begin_call(&self) -> InFlight<'_> {
        if self.config.rate_limit_per_minute.is_some() {
            let now = Instant::now();
            let mut calls = self.recent_calls.lock().unwrap_or_else(PoisonError::into_inner);
            prune(&mut calls, now);
            calls.push_back(now);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    /// Cumulative usage.
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            name: self.config.name.clone(),
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

fn prune(calls: &mut VecDeque<Instant>, now: Instant) {
    while calls.front().is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW) {
        calls.pop_front();
    }
}

/// Decrements the in-flight count on drop.
pub struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_models::{MockProvider, ProviderKind};

    fn descriptor(config: ProviderConfig) -> ProviderDescriptor {
        let adapter = Arc::new(MockProvider::new(config.name.clone()));
        ProviderDescriptor::new(config, adapter)
    }

    #[test]
    fn test_first_success_sets_latency() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        d.record_success(400, None, 0.2);
        let s = d.snapshot();
        assert!((s.avg_latency_ms - 400.0).abs() < 1e-9);
        assert!((s.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_updates() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        d.record_success(100, None, 0.2);
        d.record_success(200, None, 0.2);
        // 0.2 * 200 + 0.8 * 100
        assert!((d.snapshot().avg_latency_ms - 120.0).abs() < 1e-9);
        d.record_failure(0.2, 0.5);
        assert!((d.snapshot().success_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_floor_marks_unhealthy_once() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        // 1.0 -> 0.8 -> 0.64 -> 0.512 -> 0.4096
        let transitions: Vec<bool> = (0..5).map(|_| d.record_failure(0.2, 0.5)).collect();
        assert_eq!(transitions, vec![false, false, false, true, false]);
        assert!(!d.is_healthy());
    }

    #[test]
    fn test_restore_resets_snapshot() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        d.set_health(false, 0.1, 900.0);
        d.restore(35);
        let s = d.snapshot();
        assert!(s.healthy);
        assert!((s.success_rate - 1.0).abs() < 1e-9);
        assert!((s.avg_latency_ms - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_in_flight_guard() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        let first = d.begin_call();
        let second = d.begin_call();
        assert_eq!(d.snapshot().in_flight, 2);
        drop(first);
        drop(second);
        assert_eq!(d.snapshot().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock).with_rate_limit(2));
        drop(d.begin_call());
        assert!(!d.is_rate_limited());
        drop(d.begin_call());
        assert!(d.is_rate_limited());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!d.is_rate_limited());
    }

    #[test]
    fn test_stats_accumulate_usage() {
        let d = descriptor(ProviderConfig::new("a", ProviderKind::Mock));
        d.record_success(10, Some(TokenUsage::new(3, 4)), 0.2);
        d.record_failure(0.2, 0.5);
        let stats = d.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.prompt_tokens, 3);
        assert_eq!(stats.completion_tokens, 4);
    }
}
