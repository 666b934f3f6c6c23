//! Cost model for ranking candidate peers
//!
//! Raw metrics are min-max normalized against the current candidate set, so a
//! peer's cost is always relative to whoever else is available right now.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use super::SchedulerWeights;
use crate::metrics::PeerPerformanceMetrics;
use crate::peer::PeerId;

/// Normalized value used for peers without history and for flat ranges
const NEUTRAL_SIGNAL: f64 = 0.5;

/// Costs closer than this are treated as ties
const COST_EPSILON: f64 = 1e-9;

/// Per-candidate penalties, each in `[0, 1]` where higher is worse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandidateSignals {
    pub reputation_penalty: f64,
    pub throughput_penalty: f64,
    pub rtt_penalty: f64,
    pub failure_rate: f64,
}

impl CandidateSignals {
    pub fn neutral() -> Self {
        Self {
            reputation_penalty: NEUTRAL_SIGNAL,
            throughput_penalty: NEUTRAL_SIGNAL,
            rtt_penalty: NEUTRAL_SIGNAL,
            failure_rate: NEUTRAL_SIGNAL,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [
            self.reputation_penalty,
            self.throughput_penalty,
            self.rtt_penalty,
            self.failure_rate,
        ]
    }
}

/// Scored candidate, ready for ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateCost {
    pub peer_id: PeerId,
    pub cost: f64,
    pub in_flight: usize,
    pub signals: CandidateSignals,
}

/// Min and max of a set of values, `None` when empty.
pub(crate) fn value_range(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    values.into_iter().fold(None, |range, v| match range {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Maps `value` into `[0, 1]` relative to `range`; flat ranges map to neutral.
pub(crate) fn normalize(value: f64, range: (f64, f64)) -> f64 {
    let (lo, hi) = range;
    if hi - lo <= f64::EPSILON {
        return NEUTRAL_SIGNAL;
    }
    ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Like [`normalize`], but a zero average (no sample yet) or a missing range
/// maps to neutral.
pub(crate) fn normalize_sampled(value: f64, range: Option<(f64, f64)>) -> f64 {
    match range {
        Some(range) if value > 0.0 => normalize(value, range),
        _ => NEUTRAL_SIGNAL,
    }
}

/// Computes normalized penalties for every candidate.
///
/// Peers with no request history get neutral values so they are neither
/// favoured nor starved. Each latency signal is neutral for a peer that has
/// no sample of it yet, and only sampled peers shape that signal's range.
pub fn candidate_signals(candidates: &[PeerPerformanceMetrics]) -> Vec<CandidateSignals> {
    let throughput_range = value_range(
        candidates
            .iter()
            .filter(|m| m.has_history() && m.has_throughput_sample())
            .map(|m| m.throughput_avg_bytes_per_sec),
    );
    let rtt_range = value_range(
        candidates
            .iter()
            .filter(|m| m.has_history() && m.has_rtt_sample())
            .map(|m| m.rtt_avg_ms),
    );

    candidates
        .iter()
        .map(|metrics| {
            if !metrics.has_history() {
                return CandidateSignals::neutral();
            }
            let throughput_penalty = match throughput_range {
                Some(range) if metrics.has_throughput_sample() => {
                    1.0 - normalize(metrics.throughput_avg_bytes_per_sec, range)
                }
                _ => NEUTRAL_SIGNAL,
            };
            let rtt_penalty = match rtt_range {
                Some(range) if metrics.has_rtt_sample() => normalize(metrics.rtt_avg_ms, range),
                _ => NEUTRAL_SIGNAL,
            };
            CandidateSignals {
                reputation_penalty: 1.0 - metrics.reputation_score.clamp(0.0, 1.0),
                throughput_penalty,
                rtt_penalty,
                failure_rate: metrics.recent_failure_rate(),
            }
        })
        .collect()
}

/// Scores candidates and sorts them best first.
///
/// Ordering: lowest cost, then fewest in-flight chunks, then peer id.
pub fn rank_candidates(
    weights: &SchedulerWeights,
    candidates: &[PeerPerformanceMetrics],
    in_flight: &HashMap<PeerId, usize>,
) -> Vec<CandidateCost> {
    let mut ranked: Vec<CandidateCost> = candidates
        .iter()
        .zip(candidate_signals(candidates))
        .map(|(metrics, signals)| CandidateCost {
            peer_id: metrics.peer_id.clone(),
            cost: weights.cost_of(&signals),
            in_flight: in_flight.get(&metrics.peer_id).copied().unwrap_or(0),
            signals,
        })
        .collect();

    ranked.sort_by(compare_candidates);
    ranked
}

fn compare_candidates(a: &CandidateCost, b: &CandidateCost) -> Ordering {
    let by_cost = if (a.cost - b.cost).abs() <= COST_EPSILON {
        Ordering::Equal
    } else {
        a.cost.total_cmp(&b.cost)
    };

    by_cost
        .then(a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experienced(
        id: &str,
        throughput: f64,
        rtt: f64,
        failed: u32,
        reputation: f64,
    ) -> PeerPerformanceMetrics {
        PeerPerformanceMetrics {
            peer_id: PeerId::new(id),
            rtt_avg_ms: rtt,
            throughput_avg_bytes_per_sec: throughput,
            chunks_requested: 10,
            chunks_completed: 10 - failed,
            chunks_failed: failed,
            chunks_timed_out: 0,
            reputation_score: reputation,
        }
    }

    #[test]
    fn test_normalization_is_relative_to_candidates() {
        let candidates = vec![
            experienced("fast", 1_000_000.0, 20.0, 0, 0.9),
            experienced("slow", 100_000.0, 200.0, 0, 0.9),
        ];
        let signals = candidate_signals(&candidates);
        assert_eq!(signals[0].throughput_penalty, 0.0);
        assert_eq!(signals[0].rtt_penalty, 0.0);
        assert_eq!(signals[1].throughput_penalty, 1.0);
        assert_eq!(signals[1].rtt_penalty, 1.0);
    }

    #[test]
    fn test_new_peer_gets_neutral_signals() {
        let candidates = vec![
            experienced("old", 500_000.0, 50.0, 2, 0.7),
            PeerPerformanceMetrics::unknown(PeerId::new("new")),
        ];
        let signals = candidate_signals(&candidates);
        assert_eq!(signals[1], CandidateSignals::neutral());
        // A lone experienced peer has a flat range
        assert_eq!(signals[0].throughput_penalty, 0.5);
    }

    #[test]
    fn test_missing_rtt_sample_is_neutral_not_best() {
        let candidates = vec![
            experienced("near", 500_000.0, 20.0, 0, 0.9),
            experienced("far", 500_000.0, 200.0, 0, 0.9),
            experienced("unsampled", 800_000.0, 0.0, 0, 0.9),
        ];
        let signals = candidate_signals(&candidates);
        assert_eq!(signals[0].rtt_penalty, 0.0);
        assert_eq!(signals[1].rtt_penalty, 1.0);
        assert_eq!(signals[2].rtt_penalty, NEUTRAL_SIGNAL);
        // Throughput was sampled, so it still ranks on that signal.
        assert_eq!(signals[2].throughput_penalty, 0.0);
    }

    #[test]
    fn test_missing_throughput_sample_is_neutral() {
        let candidates = vec![
            experienced("quick", 1_000_000.0, 50.0, 0, 0.9),
            experienced("sluggish", 100_000.0, 50.0, 0, 0.9),
            experienced("silent", 0.0, 50.0, 0, 0.9),
        ];
        let signals = candidate_signals(&candidates);
        assert_eq!(signals[0].throughput_penalty, 0.0);
        assert_eq!(signals[1].throughput_penalty, 1.0);
        assert_eq!(signals[2].throughput_penalty, NEUTRAL_SIGNAL);
    }

    #[test]
    fn test_ranking_prefers_lowest_cost() {
        let candidates = vec![
            experienced("slow", 100_000.0, 200.0, 3, 0.5),
            experienced("fast", 1_000_000.0, 20.0, 0, 0.95),
        ];
        let ranked = rank_candidates(&SchedulerWeights::default(), &candidates, &HashMap::new());
        assert_eq!(ranked[0].peer_id, PeerId::new("fast"));
        assert!(ranked[0].cost < ranked[1].cost);
    }

    #[test]
    fn test_ties_break_on_in_flight_then_peer_id() {
        let candidates = vec![
            experienced("c", 500_000.0, 50.0, 0, 0.9),
            experienced("b", 500_000.0, 50.0, 0, 0.9),
            experienced("a", 500_000.0, 50.0, 0, 0.9),
        ];
        let mut in_flight = HashMap::new();
        in_flight.insert(PeerId::new("a"), 2);

        let ranked = rank_candidates(&SchedulerWeights::default(), &candidates, &in_flight);
        let order: Vec<&str> = ranked.iter().map(|c| c.peer_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_value_range_of_empty_is_none() {
        assert_eq!(value_range(Vec::<f64>::new()), None);
        assert_eq!(value_range(vec![3.0, 1.0, 2.0]), Some((1.0, 3.0)));
    }
}
