//! Online learning of cost-model weights from observed chunk outcomes
//!
//! Each completion is stored with the metric snapshot the scheduler saw for
//! that peer. Periodically the signals are compared between failed and
//! successful completions: the signal that best separates them gains weight,
//! the one that separates them worst loses it, and the weights are
//! renormalized.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::cost::{normalize_sampled, value_range};
use super::{
    ChunkAssignment, ChunkRequest, ChunkScheduler, ChunkScheduling, DegradationReason,
    SchedulerError, SchedulerWeights,
};
use crate::config::AdaptiveConfig;
use crate::metrics::PeerPerformanceMetrics;
use crate::peer::PeerId;

/// Separation below which two signals are considered equally predictive
const DISCRIMINATION_EPSILON: f64 = 1e-9;

/// One observed chunk outcome with the peer's metrics at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompletionRecord {
    pub chunk_index: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub bytes: u64,
    pub reputation: f64,
    pub throughput: f64,
    pub rtt_ms: f64,
    pub failure_rate: f64,
}

impl CompletionRecord {
    fn from_snapshot(
        chunk_index: u32,
        success: bool,
        duration_ms: u64,
        bytes: u64,
        snapshot: &PeerPerformanceMetrics,
    ) -> Self {
        Self {
            chunk_index,
            success,
            duration_ms,
            bytes,
            reputation: snapshot.reputation_score.clamp(0.0, 1.0),
            throughput: snapshot.throughput_avg_bytes_per_sec,
            rtt_ms: snapshot.rtt_avg_ms,
            failure_rate: snapshot.recent_failure_rate(),
        }
    }
}

/// Fixed-capacity FIFO of a peer's most recent completions.
#[derive(Debug, Clone)]
pub struct CompletionWindow {
    records: VecDeque<CompletionRecord>,
    capacity: usize,
}

impl CompletionWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends a record, evicting and returning the oldest one when full.
    pub fn push(&mut self, record: CompletionRecord) -> Option<CompletionRecord> {
        let evicted = if self.records.len() == self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CompletionRecord> {
        self.records.iter()
    }
}

/// Read-only view of the adaptive scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub reputation_weight: f64,
    pub throughput_weight: f64,
    pub rtt_weight: f64,
    pub recent_performance_weight: f64,
    pub total_completions: u64,
    pub tracked_peers: usize,
}

#[derive(Debug, Default)]
struct LearningState {
    windows: HashMap<PeerId, CompletionWindow>,
    total_completions: u64,
    since_last_adaptation: u64,
}

/// Scheduler decorator that adapts its weights to observed outcomes.
///
/// Assignment calls are forwarded unchanged to the wrapped [`ChunkScheduler`].
pub struct AdaptiveScheduler {
    inner: ChunkScheduler,
    config: AdaptiveConfig,
    state: Mutex<LearningState>,
}

impl AdaptiveScheduler {
    pub fn new(inner: ChunkScheduler, config: AdaptiveConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(LearningState::default()),
        }
    }

    pub fn inner(&self) -> &ChunkScheduler {
        &self.inner
    }

    pub fn weights(&self) -> SchedulerWeights {
        self.inner.weights()
    }

    /// Records the outcome of a chunk request from `peer`.
    ///
    /// The chunk stops being outstanding for `peer` either way. Every
    /// `adaptation_interval` completions an adaptation pass runs.
    pub async fn record_chunk_completion(
        &self,
        chunk_index: u32,
        peer: &PeerId,
        success: bool,
        duration_ms: u64,
        bytes_transferred: u64,
    ) {
        let snapshot = self
            .inner
            .metrics_provider()
            .metrics(peer)
            .unwrap_or_else(|| PeerPerformanceMetrics::unknown(peer.clone()));
        let record = CompletionRecord::from_snapshot(
            chunk_index,
            success,
            duration_ms,
            bytes_transferred,
            &snapshot,
        );

        let adapt_now = {
            let mut state = self.state.lock();
            let window_size = self.config.window_size;
            state
                .windows
                .entry(peer.clone())
                .or_insert_with(|| CompletionWindow::new(window_size))
                .push(record);
            state.total_completions += 1;
            state.since_last_adaptation += 1;

            if state.since_last_adaptation >= self.config.adaptation_interval {
                state.since_last_adaptation = 0;
                true
            } else {
                false
            }
        };

        self.inner.registry().unregister_if_owner(chunk_index, peer);

        if adapt_now {
            self.adapt_weights().await;
        }
    }

    /// Recomputes the weights from the recent completion windows.
    ///
    /// Leaves the weights untouched when fewer than `min_samples` completions
    /// are remembered, or when the samples contain only successes or only
    /// failures. Returns the weights in effect afterwards.
    pub async fn adapt_weights(&self) -> SchedulerWeights {
        let current = self.inner.weights();
        let records: Vec<CompletionRecord> = {
            let state = self.state.lock();
            state
                .windows
                .values()
                .flat_map(|window| window.iter().copied())
                .collect()
        };

        if records.len() < self.config.min_samples {
            tracing::debug!(
                samples = records.len(),
                required = self.config.min_samples,
                "Skipping weight adaptation, not enough samples"
            );
            return current;
        }

        let Some(discrimination) = signal_discrimination(&records) else {
            tracing::debug!("Skipping weight adaptation, outcomes are not mixed");
            return current;
        };

        let Some(updated) = self.shift_weights(current, discrimination) else {
            return current;
        };

        self.inner.replace_weights(updated);
        tracing::info!(
            reputation = updated.reputation_weight,
            throughput = updated.throughput_weight,
            rtt = updated.rtt_weight,
            recent = updated.recent_performance_weight,
            samples = records.len(),
            "Adapted scheduler weights"
        );
        updated
    }

    fn shift_weights(
        &self,
        current: SchedulerWeights,
        discrimination: [f64; 4],
    ) -> Option<SchedulerWeights> {
        let mut best = 0;
        let mut worst = 0;
        for (i, value) in discrimination.iter().enumerate() {
            if *value > discrimination[best] {
                best = i;
            }
            if *value < discrimination[worst] {
                worst = i;
            }
        }
        if discrimination[best] - discrimination[worst] <= DISCRIMINATION_EPSILON {
            return None;
        }

        let mut weights = current.as_array();
        weights[best] = (weights[best] + self.config.learning_rate).min(1.0);
        weights[worst] = (weights[worst] - self.config.learning_rate).max(self.config.min_weight);
        Some(SchedulerWeights::from_array(weights).normalized())
    }

    /// Snapshot of weights and learning counters.
    pub fn stats(&self) -> SchedulerStats {
        let weights = self.inner.weights();
        let state = self.state.lock();
        SchedulerStats {
            reputation_weight: weights.reputation_weight,
            throughput_weight: weights.throughput_weight,
            rtt_weight: weights.rtt_weight,
            recent_performance_weight: weights.recent_performance_weight,
            total_completions: state.total_completions,
            tracked_peers: state.windows.len(),
        }
    }

    /// Completions currently remembered for `peer`.
    pub fn window_len(&self, peer: &PeerId) -> usize {
        self.state
            .lock()
            .windows
            .get(peer)
            .map(CompletionWindow::len)
            .unwrap_or(0)
    }
}

/// Mean penalty among failures minus mean penalty among successes, per signal.
///
/// `None` when the records are all successes or all failures.
fn signal_discrimination(records: &[CompletionRecord]) -> Option<[f64; 4]> {
    if records.is_empty() {
        return None;
    }
    // Unsampled averages read zero; keep them out of the ranges.
    let throughput_range = value_range(records.iter().map(|r| r.throughput).filter(|v| *v > 0.0));
    let rtt_range = value_range(records.iter().map(|r| r.rtt_ms).filter(|v| *v > 0.0));

    let penalties = |record: &CompletionRecord| -> [f64; 4] {
        [
            1.0 - record.reputation,
            1.0 - normalize_sampled(record.throughput, throughput_range),
            normalize_sampled(record.rtt_ms, rtt_range),
            record.failure_rate,
        ]
    };

    let mut failed_sum = [0.0; 4];
    let mut success_sum = [0.0; 4];
    let mut failed_count = 0usize;
    let mut success_count = 0usize;

    for record in records {
        let (sum, count) = if record.success {
            (&mut success_sum, &mut success_count)
        } else {
            (&mut failed_sum, &mut failed_count)
        };
        for (acc, value) in sum.iter_mut().zip(penalties(record)) {
            *acc += value;
        }
        *count += 1;
    }

    if failed_count == 0 || success_count == 0 {
        return None;
    }

    let mut spread = [0.0; 4];
    for i in 0..4 {
        spread[i] = failed_sum[i] / failed_count as f64 - success_sum[i] / success_count as f64;
    }
    Some(spread)
}

#[async_trait]
impl ChunkScheduling for AdaptiveScheduler {
    async fn assign_chunk(
        &self,
        request: ChunkRequest,
        candidates: &[PeerId],
    ) -> Result<ChunkAssignment, SchedulerError> {
        self.inner.assign_chunk(request, candidates).await
    }

    async fn assign_multiple_chunks(
        &self,
        requests: &[ChunkRequest],
        candidates: &[PeerId],
    ) -> Result<Vec<ChunkAssignment>, SchedulerError> {
        self.inner.assign_multiple_chunks(requests, candidates).await
    }

    async fn handle_peer_degradation(&self, peer: &PeerId, reason: DegradationReason) -> Vec<u32> {
        let freed = self.inner.handle_peer_degradation(peer, reason).await;
        // History from before the degradation no longer describes this peer.
        self.state.lock().windows.remove(peer);
        freed
    }

    fn register_assignment(&self, chunk_index: u32, peer: PeerId) {
        self.inner.register_assignment(chunk_index, peer);
    }

    fn unregister_assignment(&self, chunk_index: u32) -> Option<PeerId> {
        self.inner.unregister_assignment(chunk_index)
    }

    fn assigned_peer(&self, chunk_index: u32) -> Option<PeerId> {
        self.inner.assigned_peer(chunk_index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::test_fixtures::{StaticMetrics, peer_ids, uniform_metrics};

    fn adaptive_with(metrics: StaticMetrics, config: AdaptiveConfig) -> AdaptiveScheduler {
        let inner = ChunkScheduler::new(SchedulerConfig::default(), Arc::new(metrics));
        AdaptiveScheduler::new(inner, config)
    }

    fn record(index: u32, success: bool) -> CompletionRecord {
        CompletionRecord {
            chunk_index: index,
            success,
            duration_ms: 10,
            bytes: 100,
            reputation: 0.5,
            throughput: 1.0,
            rtt_ms: 1.0,
            failure_rate: 0.0,
        }
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let mut window = CompletionWindow::new(3);
        for i in 0..3 {
            assert!(window.push(record(i, true)).is_none());
        }
        let evicted = window.push(record(3, true)).unwrap();
        assert_eq!(evicted.chunk_index, 0);
        let kept: Vec<u32> = window.iter().map(|r| r.chunk_index).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn test_unsampled_rtt_does_not_read_as_fast() {
        let mut near = record(0, true);
        near.rtt_ms = 10.0;
        let mut far = record(1, true);
        far.rtt_ms = 50.0;
        let mut unsampled = record(2, false);
        unsampled.rtt_ms = 0.0;

        let spread = signal_discrimination(&[near, far, unsampled]).unwrap();
        assert!(spread[2].abs() < 1e-9, "rtt spread {}", spread[2]);
    }

    #[test]
    fn test_stats_before_adaptation_are_defaults() {
        let scheduler = adaptive_with(StaticMetrics::new(), AdaptiveConfig::default());
        let stats = scheduler.stats();
        let defaults = SchedulerWeights::default();
        assert_eq!(stats.reputation_weight, defaults.reputation_weight);
        assert_eq!(stats.throughput_weight, defaults.throughput_weight);
        assert_eq!(stats.rtt_weight, defaults.rtt_weight);
        assert_eq!(stats.recent_performance_weight, defaults.recent_performance_weight);
        assert_eq!(stats.total_completions, 0);
        assert_eq!(stats.tracked_peers, 0);
    }

    #[tokio::test]
    async fn test_under_sampled_adaptation_is_a_no_op() {
        let peers = peer_ids(&["fast", "slow"]);
        let metrics = StaticMetrics::new()
            .with_peer("fast", 2_000_000.0, 20.0, 0.9)
            .with_peer("slow", 10_000.0, 400.0, 0.9);
        let scheduler = adaptive_with(metrics, AdaptiveConfig::default());

        for i in 0..4 {
            scheduler.record_chunk_completion(i, &peers[0], true, 10, 1_000).await;
            scheduler.record_chunk_completion(i, &peers[1], false, 10, 0).await;
        }

        let before = scheduler.weights();
        let after = scheduler.adapt_weights().await;
        assert_eq!(before, after);
        assert_eq!(scheduler.weights(), before);
    }

    #[tokio::test]
    async fn test_predictive_signal_gains_weight() {
        let peers = peer_ids(&["fast", "slow"]);
        let metrics = StaticMetrics::new()
            .with_peer("fast", 2_000_000.0, 50.0, 0.9)
            .with_peer("slow", 10_000.0, 50.0, 0.9);
        let scheduler = adaptive_with(metrics, AdaptiveConfig::default());

        for i in 0..10 {
            scheduler.record_chunk_completion(i, &peers[0], true, 10, 1_000).await;
            scheduler.record_chunk_completion(i + 100, &peers[1], false, 10, 0).await;
        }

        let defaults = SchedulerWeights::default();
        let adapted = scheduler.adapt_weights().await;
        assert!(adapted.is_normalized());
        assert!(adapted.throughput_weight > defaults.throughput_weight);
        assert!(adapted.reputation_weight < defaults.reputation_weight);
    }

    #[tokio::test]
    async fn test_all_successes_leave_weights_alone() {
        let peers = peer_ids(&["a", "b"]);
        let scheduler = adaptive_with(uniform_metrics(&peers), AdaptiveConfig::default());
        for i in 0..20 {
            scheduler
                .record_chunk_completion(i, &peers[(i % 2) as usize], true, 10, 1_000)
                .await;
        }
        assert_eq!(scheduler.adapt_weights().await, SchedulerWeights::default());
    }

    #[tokio::test]
    async fn test_adaptation_runs_every_interval() {
        let peers = peer_ids(&["fast", "slow"]);
        let metrics = StaticMetrics::new()
            .with_peer("fast", 2_000_000.0, 50.0, 0.9)
            .with_peer("slow", 10_000.0, 50.0, 0.9);
        let config = AdaptiveConfig {
            adaptation_interval: 20,
            ..AdaptiveConfig::default()
        };
        let scheduler = adaptive_with(metrics, config);

        for i in 0..9 {
            scheduler.record_chunk_completion(i, &peers[0], true, 10, 1_000).await;
            scheduler.record_chunk_completion(i, &peers[1], false, 10, 0).await;
        }
        assert_eq!(scheduler.weights(), SchedulerWeights::default());

        scheduler.record_chunk_completion(50, &peers[0], true, 10, 1_000).await;
        scheduler.record_chunk_completion(51, &peers[1], false, 10, 0).await;
        assert_ne!(scheduler.weights(), SchedulerWeights::default());
        assert_eq!(scheduler.stats().total_completions, 20);
    }

    #[tokio::test]
    async fn test_completion_clears_registry_entry_for_that_peer() {
        let peers = peer_ids(&["a", "b"]);
        let scheduler = adaptive_with(uniform_metrics(&peers), AdaptiveConfig::default());
        scheduler.register_assignment(1, peers[0].clone());
        scheduler.register_assignment(2, peers[1].clone());

        scheduler.record_chunk_completion(1, &peers[0], true, 5, 10).await;
        // A late report from a peer that no longer owns the chunk changes nothing
        scheduler.record_chunk_completion(2, &peers[0], false, 5, 0).await;

        assert_eq!(scheduler.assigned_peer(1), None);
        assert_eq!(scheduler.assigned_peer(2), Some(peers[1].clone()));
    }

    #[tokio::test]
    async fn test_degradation_flushes_window() {
        let peers = peer_ids(&["a", "b"]);
        let scheduler = adaptive_with(uniform_metrics(&peers), AdaptiveConfig::default());
        scheduler.record_chunk_completion(1, &peers[0], true, 5, 10).await;
        scheduler.record_chunk_completion(2, &peers[1], true, 5, 10).await;
        scheduler.register_assignment(3, peers[0].clone());

        let freed = scheduler
            .handle_peer_degradation(&peers[0], DegradationReason::HighErrorRate)
            .await;
        assert_eq!(freed, vec![3]);
        assert_eq!(scheduler.window_len(&peers[0]), 0);
        assert_eq!(scheduler.window_len(&peers[1]), 1);
        assert_eq!(scheduler.stats().tracked_peers, 1);
    }

    #[tokio::test]
    async fn test_assignment_delegates_unchanged() {
        let peers = peer_ids(&["P1", "P2", "P3"]);
        let scheduler = adaptive_with(uniform_metrics(&peers), AdaptiveConfig::default());
        let requests = ChunkRequest::plan(3_000_000, 1_000_000).unwrap();
        let assignments = scheduler
            .assign_multiple_chunks(&requests, &peers)
            .await
            .unwrap();
        assert!(assignments.iter().all(|a| a.success));
        assert_eq!(scheduler.inner().registry().len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_weights_stay_normalized(
            outcomes in proptest::collection::vec(
                (0usize..4, any::<bool>(), 1u64..5_000, 0u64..2_000_000),
                0..300,
            ),
            learning_rate in 0.01f64..0.5,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let metrics = StaticMetrics::new()
                .with_peer("a", 2_000_000.0, 10.0, 0.95)
                .with_peer("b", 500_000.0, 80.0, 0.6)
                .with_peer("c", 50_000.0, 300.0, 0.3);
            let config = AdaptiveConfig {
                adaptation_interval: 7,
                learning_rate,
                ..AdaptiveConfig::default()
            };
            let scheduler = adaptive_with(metrics, config);
            let peers = peer_ids(&["a", "b", "c", "unknown"]);

            runtime.block_on(async {
                for (i, (peer, success, duration, bytes)) in outcomes.into_iter().enumerate() {
                    scheduler
                        .record_chunk_completion(i as u32, &peers[peer], success, duration, bytes)
                        .await;
                    scheduler.adapt_weights().await;
                }
            });

            let weights = scheduler.weights();
            prop_assert!(weights.is_normalized(), "weights drifted: {:?}", weights);
        }
    }
}
