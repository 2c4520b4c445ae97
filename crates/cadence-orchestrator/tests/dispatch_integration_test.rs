//! Integration tests for provider selection, failover and caching.

mod common;

use cadence_abstraction::{CompletionRequest, ProviderError};
use cadence_models::MockProvider;
use cadence_orchestrator::{DispatchError, EvidenceKind};
use common::{balancer, mock_config, orchestrator, unavailable};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_selection_is_a_pure_function_of_snapshots() {
    let mocks: Vec<Arc<MockProvider>> =
        ["a", "b", "c"].iter().map(|n| Arc::new(MockProvider::new(*n))).collect();
    let mut config = mock_config(&["a", "b", "c"]);
    config.cache.enabled = false;
    let orchestrator = orchestrator(config, &mocks);

    let registry = orchestrator.registry();
    registry.get("a").unwrap().set_health(true, 0.7, 900.0);
    registry.get("b").unwrap().set_health(true, 0.9, 300.0);
    registry.get("c").unwrap().set_health(true, 0.8, 300.0);

    let first = balancer(&orchestrator);
    let second = balancer(&orchestrator);
    for _ in 0..10 {
        assert_eq!(first.select().unwrap().name(), "b");
        assert_eq!(second.select().unwrap().name(), "b");
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_failover_skips_unhealthy_provider() {
    let a = Arc::new(MockProvider::new("a").with_latency(Duration::from_secs(10)));
    let b = Arc::new(MockProvider::new("b"));
    let c = Arc::new(MockProvider::new("c"));
    let mut config = mock_config(&["a", "b", "c"]);
    config.cache.enabled = false;
    let orchestrator = orchestrator(config, &[a.clone(), b.clone(), c.clone()]);

    let registry = orchestrator.registry();
    registry.get("a").unwrap().set_health(true, 0.95, 200.0);
    registry.get("b").unwrap().set_health(true, 0.9, 500.0);
    registry.get("c").unwrap().set_health(false, 1.0, 10.0);

    let balancer = balancer(&orchestrator);
    assert_eq!(balancer.select().unwrap().name(), "a");

    let request = CompletionRequest::new("summarize the design").with_timeout_ms(1_000);
    let mut evidence = Vec::new();
    let response =
        balancer.dispatch_with(&request, &CancellationToken::new(), &mut evidence).await.unwrap();

    assert_eq!(response.provider, "b");
    assert_eq!(c.calls(), 0);
    assert!(a.calls() >= 1);
    assert!(evidence.iter().any(|e| e.kind == EvidenceKind::Failover && e.provider.as_deref() == Some("b")));
}

#[tokio::test]
async fn test_all_providers_failing_is_bounded() {
    let mocks: Vec<Arc<MockProvider>> = ["a", "b", "c"]
        .iter()
        .map(|n| Arc::new(MockProvider::failing(*n, unavailable(n))))
        .collect();
    let orchestrator = orchestrator(mock_config(&["a", "b", "c"]), &mocks);
    let balancer = balancer(&orchestrator);

    let err = balancer.dispatch(&CompletionRequest::new("anything")).await.unwrap_err();
    match err {
        DispatchError::AllProvidersFailed { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, Some(ProviderError::Unavailable { .. })));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(mocks.iter().all(|m| m.calls() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_in_place_then_exhaust() {
    let network = |n: &str| ProviderError::Network { provider: n.to_string(), message: "reset".to_string() };
    let mocks: Vec<Arc<MockProvider>> =
        ["a", "b"].iter().map(|n| Arc::new(MockProvider::failing(*n, network(n)))).collect();
    let orchestrator = orchestrator(mock_config(&["a", "b"]), &mocks);
    let balancer = balancer(&orchestrator);

    let mut evidence = Vec::new();
    let err = balancer
        .dispatch_with(&CompletionRequest::new("x"), &CancellationToken::new(), &mut evidence)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AllProvidersFailed { attempts: 2, .. }));
    let max = orchestrator.config().recovery.max_transient_attempts as usize;
    assert!(mocks.iter().all(|m| m.calls() <= max));
    assert!(evidence.iter().any(|e| e.kind == EvidenceKind::Retry));
    assert_eq!(balancer.recovery().stats().transient as usize, mocks.iter().map(|m| m.calls()).sum::<usize>());
}

#[tokio::test]
async fn test_scenario_c_identical_request_served_from_cache() {
    let mock = Arc::new(MockProvider::new("a"));
    let orchestrator = orchestrator(mock_config(&["a"]), &[mock.clone()]);
    let balancer = balancer(&orchestrator);
    let request = CompletionRequest::new("explain backpressure").with_temperature(0.0);

    let first = balancer.dispatch(&request).await.unwrap();
    let mut evidence = Vec::new();
    let second =
        balancer.dispatch_with(&request, &CancellationToken::new(), &mut evidence).await.unwrap();

    assert_eq!(mock.calls(), 1);
    assert_eq!(first, second);
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].kind, EvidenceKind::CacheHit);
}

#[tokio::test]
async fn test_cache_hit_leaves_health_untouched() {
    let mock = Arc::new(MockProvider::new("a"));
    let orchestrator = orchestrator(mock_config(&["a"]), &[mock.clone()]);
    let balancer = balancer(&orchestrator);
    let request = CompletionRequest::new("explain backpressure");

    balancer.dispatch(&request).await.unwrap();
    let before = orchestrator.registry().stats();
    balancer.dispatch(&request).await.unwrap();
    assert_eq!(orchestrator.registry().stats(), before);
}

#[tokio::test]
async fn test_cache_shared_across_runs() {
    let mock = Arc::new(MockProvider::new("a"));
    let orchestrator = orchestrator(mock_config(&["a"]), &[mock.clone()]);
    let request = CompletionRequest::new("explain backpressure");

    balancer(&orchestrator).dispatch(&request).await.unwrap();
    balancer(&orchestrator).dispatch(&request).await.unwrap();
    assert_eq!(mock.calls(), 1);
}
