//! Adaptive provider scoring.
//!
//! `score = w_latency * 1/(1 + latency_secs) + w_success * success_rate
//!        + w_load * (1 - in_flight/max_concurrency) + w_cost * (1 - cost/max_cost)`
//!
//! Every term lies in [0, 1]. Selection is a pure function of the candidate
//! list and the weights, so identical snapshots always pick the same provider.

use super::descriptor::HealthSnapshot;
use crate::config::ScoringWeights;

/// Selection input for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Health at selection time.
    pub snapshot: HealthSnapshot,
    /// Configured concurrency used for the load term.
    pub max_concurrency: u32,
    /// Configured relative cost.
    pub cost_weight: f64,
    /// False when the provider must not be picked (revoked, not preferred,
    /// over its local rate limit, or already tried for this request).
    pub eligible: bool,
}

/// Scores one candidate. `max_cost` is the largest cost weight among all
/// configured providers.
#[must_use]
pub fn score(candidate: &Candidate, weights: &ScoringWeights, max_cost: f64) -> f64 {
    let snapshot = &candidate.snapshot;
    let latency_term = 1.0 / (1.0 + snapshot.avg_latency_ms.max(0.0) / 1000.0);
    let success_term = snapshot.success_rate.clamp(0.0, 1.0);
    let load_term = if candidate.max_concurrency == 0 {
        0.0
    } else {
        (1.0 - f64::from(snapshot.in_flight) / f64::from(candidate.max_concurrency)).max(0.0)
    };
    let cost_term = if max_cost > 0.0 { 1.0 - (candidate.cost_weight / max_cost).min(1.0) } else { 1.0 };

    weights.latency * latency_term
        + weights.success * success_term
        + weights.load * load_term
        + weights.cost * cost_term
}

/// Returns the index of the best healthy, eligible candidate.
///
/// Ties go to the earlier candidate (declaration order).
#[must_use]
pub fn select_provider(candidates: &[Candidate], weights: &ScoringWeights) -> Option<usize> {
    let max_cost = candidates.iter().map(|c| c.cost_weight).fold(0.0_f64, f64::max);

    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.eligible || !candidate.snapshot.healthy {
            continue;
        }
        let value = score(candidate, weights, max_cost);
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(success_rate: f64, latency_ms: f64, healthy: bool) -> Candidate {
        Candidate {
            snapshot: HealthSnapshot { healthy, avg_latency_ms: latency_ms, success_rate, in_flight: 0 },
            max_concurrency: 8,
            cost_weight: 1.0,
            eligible: true,
        }
    }

    #[test]
    fn test_prefers_fast_reliable_provider() {
        let candidates =
            vec![candidate(0.95, 200.0, true), candidate(0.9, 500.0, true), candidate(1.0, 0.0, false)];
        assert_eq!(select_provider(&candidates, &ScoringWeights::default()), Some(0));
    }

    #[test]
    fn test_unhealthy_and_ineligible_skipped() {
        let mut candidates = vec![candidate(1.0, 100.0, false), candidate(0.6, 900.0, true)];
        assert_eq!(select_provider(&candidates, &ScoringWeights::default()), Some(1));
        candidates[1].eligible = false;
        assert_eq!(select_provider(&candidates, &ScoringWeights::default()), None);
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let candidates = vec![candidate(0.9, 300.0, true); 3];
        assert_eq!(select_provider(&candidates, &ScoringWeights::default()), Some(0));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let candidates = vec![candidate(0.7, 250.0, true), candidate(0.8, 400.0, true)];
        let weights = ScoringWeights::default();
        let first = select_provider(&candidates, &weights);
        for _ in 0..100 {
            assert_eq!(select_provider(&candidates, &weights), first);
        }
    }

    #[test]
    fn test_load_term_penalizes_busy_provider() {
        let mut busy = candidate(1.0, 100.0, true);
        busy.snapshot.in_flight = 8;
        let idle = candidate(1.0, 100.0, true);
        assert_eq!(select_provider(&[busy, idle], &ScoringWeights::default()), Some(1));
    }

    #[test]
    fn test_cost_term_prefers_cheaper_provider() {
        let mut expensive = candidate(1.0, 100.0, true);
        expensive.cost_weight = 4.0;
        let cheap = candidate(1.0, 100.0, true);
        assert_eq!(select_provider(&[expensive, cheap], &ScoringWeights::default()), Some(1));
    }

    #[test]
    fn test_score_bounds() {
        let weights = ScoringWeights::default();
        let perfect = candidate(1.0, 0.0, true);
        assert!((score(&perfect, &weights, 1.0) - 0.9).abs() < 1e-9);
        let mut free = perfect;
        free.cost_weight = 0.0;
        assert!((score(&free, &weights, 1.0) - 1.0).abs() < 1e-9);
    }
}
