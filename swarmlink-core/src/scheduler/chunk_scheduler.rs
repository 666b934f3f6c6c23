//! Cost-based chunk assignment

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::cost::rank_candidates;
use super::{
    AssignmentRegistry, ChunkAssignment, ChunkRequest, ChunkScheduling, DegradationReason,
    SchedulerError, SchedulerWeights,
};
use crate::config::SchedulerConfig;
use crate::metrics::{PeerMetricsProvider, PeerPerformanceMetrics};
use crate::peer::PeerId;
use crate::reputation::ReputationPolicy;

/// Assigns chunks to the cheapest eligible peer and tracks ownership.
///
/// Assignment is pure bookkeeping: no network I/O happens here. Weights are
/// fixed unless an [`super::AdaptiveScheduler`] wraps this scheduler.
pub struct ChunkScheduler {
    config: SchedulerConfig,
    metrics: Arc<dyn PeerMetricsProvider>,
    reputation: Option<Arc<dyn ReputationPolicy>>,
    registry: AssignmentRegistry,
    weights: RwLock<SchedulerWeights>,
}

impl ChunkScheduler {
    /// Creates a scheduler reading peer snapshots from `metrics`.
    pub fn new(config: SchedulerConfig, metrics: Arc<dyn PeerMetricsProvider>) -> Self {
        let weights = config.initial_weights.normalized();
        Self {
            config,
            metrics,
            reputation: None,
            registry: AssignmentRegistry::new(),
            weights: RwLock::new(weights),
        }
    }

    /// Skips peers excluded by `policy` (e.g. blacklisted) when placing chunks.
    pub fn with_reputation(mut self, policy: Arc<dyn ReputationPolicy>) -> Self {
        self.reputation = Some(policy);
        self
    }

    /// Current cost-model weights.
    pub fn weights(&self) -> SchedulerWeights {
        *self.weights.read()
    }

    pub(super) fn replace_weights(&self, weights: SchedulerWeights) {
        *self.weights.write() = weights;
    }

    pub fn registry(&self) -> &AssignmentRegistry {
        &self.registry
    }

    pub fn metrics_provider(&self) -> &Arc<dyn PeerMetricsProvider> {
        &self.metrics
    }

    /// Chunks currently owned by `peer`.
    pub fn outstanding_for(&self, peer: &PeerId) -> Vec<u32> {
        self.registry.chunks_owned_by(peer)
    }

    /// One snapshot per distinct candidate; unknown peers get neutral metrics.
    ///
    /// Peers the reputation policy excludes are dropped and counted.
    fn snapshot_metrics(&self, candidates: &[PeerId]) -> Candidates {
        let mut seen: Vec<&PeerId> = Vec::with_capacity(candidates.len());
        for peer in candidates {
            if !seen.contains(&peer) {
                seen.push(peer);
            }
        }

        let mut excluded = 0usize;
        let snapshots = seen
            .into_iter()
            .filter(|peer| {
                let blocked = self
                    .reputation
                    .as_ref()
                    .is_some_and(|policy| policy.is_excluded(peer));
                if blocked {
                    tracing::debug!(peer = %peer, "Skipping excluded peer");
                    excluded += 1;
                }
                !blocked
            })
            .map(|peer| {
                self.metrics
                    .metrics(peer)
                    .unwrap_or_else(|| PeerPerformanceMetrics::unknown(peer.clone()))
            })
            .collect();

        Candidates {
            snapshots,
            excluded,
        }
    }

    fn place(
        &self,
        request: ChunkRequest,
        candidates: &Candidates,
    ) -> Result<ChunkAssignment, SchedulerError> {
        let snapshots = &candidates.snapshots;
        let weights = self.weights();
        let chunk_index = request.chunk_index;

        let chosen = self.registry.assign_with(chunk_index, |in_flight| {
            let mut at_capacity = 0usize;
            let mut below_floor = 0usize;

            let eligible: Vec<PeerPerformanceMetrics> = snapshots
                .iter()
                .filter(|metrics| {
                    let outstanding = in_flight.get(&metrics.peer_id).copied().unwrap_or(0);
                    if outstanding >= self.config.max_in_flight_per_peer {
                        at_capacity += 1;
                        return false;
                    }
                    if metrics.reputation_score < self.config.reputation_floor {
                        below_floor += 1;
                        return false;
                    }
                    true
                })
                .cloned()
                .collect();

            rank_candidates(&weights, &eligible, in_flight)
                .into_iter()
                .next()
                .map(|best| best.peer_id)
                .ok_or_else(|| SchedulerError::AllCandidatesIneligible {
                    chunk_index,
                    reason: format!(
                        "{at_capacity} at capacity, {below_floor} below reputation floor, \
                         {} excluded by reputation policy",
                        candidates.excluded
                    ),
                })
        });

        match chosen {
            Ok(peer) => {
                tracing::debug!(chunk = chunk_index, peer = %peer, "Assigned chunk");
                Ok(ChunkAssignment::assigned(chunk_index, peer))
            }
            Err(e) => {
                tracing::warn!(chunk = chunk_index, "Chunk assignment failed: {e}");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChunkScheduling for ChunkScheduler {
    async fn assign_chunk(
        &self,
        request: ChunkRequest,
        candidates: &[PeerId],
    ) -> Result<ChunkAssignment, SchedulerError> {
        if candidates.is_empty() {
            return Err(SchedulerError::NoCandidates {
                chunk_index: request.chunk_index,
            });
        }

        let candidates = self.snapshot_metrics(candidates);
        self.place(request, &candidates)
    }

    async fn assign_multiple_chunks(
        &self,
        requests: &[ChunkRequest],
        candidates: &[PeerId],
    ) -> Result<Vec<ChunkAssignment>, SchedulerError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if candidates.is_empty() {
            return Err(SchedulerError::NoCandidates {
                chunk_index: requests[0].chunk_index,
            });
        }

        // Metrics are read once for the whole batch; in-flight counts are
        // re-read per chunk so earlier placements spread later ones.
        let candidates = self.snapshot_metrics(candidates);
        let assignments = requests
            .iter()
            .map(|request| {
                self.place(*request, &candidates).unwrap_or_else(|e| {
                    ChunkAssignment::unassigned(request.chunk_index, e.to_string())
                })
            })
            .collect();

        Ok(assignments)
    }

    async fn handle_peer_degradation(&self, peer: &PeerId, reason: DegradationReason) -> Vec<u32> {
        let freed = self.registry.release_peer(peer);
        if !freed.is_empty() {
            tracing::warn!(
                peer = %peer,
                reason = %reason,
                "Peer degraded, released {} chunks for reassignment",
                freed.len()
            );
        }
        freed
    }

    fn register_assignment(&self, chunk_index: u32, peer: PeerId) {
        self.registry.register(chunk_index, peer);
    }

    fn unregister_assignment(&self, chunk_index: u32) -> Option<PeerId> {
        self.registry.unregister(chunk_index)
    }

    fn assigned_peer(&self, chunk_index: u32) -> Option<PeerId> {
        self.registry.owner(chunk_index)
    }
}

/// Metrics snapshots for the peers still eligible after the policy check.
struct Candidates {
    snapshots: Vec<PeerPerformanceMetrics>,
    excluded: usize,
}
