//! Multi-source chunk scheduling
//!
//! Assigns fixed-size byte ranges of one file to candidate peers using a
//! weighted cost model, keeps the registry of who owns each outstanding chunk,
//! and frees a degraded peer's chunks for reassignment:
//! - [`ChunkScheduler`] - base cost-model assignment and the assignment registry
//! - [`AdaptiveScheduler`] - learns the cost-model weights from observed outcomes
//! - [`ChunkScheduling`] - the seam the orchestrator and transfers depend on

pub mod adaptive;
pub mod chunk_scheduler;
pub mod cost;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use adaptive::{AdaptiveScheduler, CompletionRecord, CompletionWindow, SchedulerStats};
pub use chunk_scheduler::ChunkScheduler;
pub use cost::{CandidateCost, CandidateSignals};
pub use registry::AssignmentRegistry;

use crate::peer::PeerId;
use crate::piece_map::{PieceMapError, chunk_count_for};

/// Tolerance used when checking that weights sum to one
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Request for one chunk of the file. Immutable once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk_index: u32,
    pub offset: u64,
    pub size: u64,
}

impl ChunkRequest {
    /// Request for chunk `chunk_index` of a file split into `chunk_size` pieces.
    ///
    /// Returns `None` if the index lies beyond the end of the file.
    pub fn for_chunk(chunk_index: u32, chunk_size: u64, file_size: u64) -> Option<Self> {
        let offset = chunk_index as u64 * chunk_size;
        if chunk_size == 0 || offset >= file_size {
            return None;
        }
        Some(Self {
            chunk_index,
            offset,
            size: chunk_size.min(file_size - offset),
        })
    }

    /// Requests covering the whole file in ascending chunk order.
    ///
    /// # Errors
    /// - `PieceMapError::ZeroChunkSize` - If `chunk_size` is zero
    /// - `PieceMapError::TooManyChunks` - If a chunk index would overflow `u32`
    pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<Self>, PieceMapError> {
        let chunk_count = chunk_count_for(file_size, chunk_size)?;
        Ok((0..chunk_count)
            .filter_map(|index| Self::for_chunk(index, chunk_size, file_size))
            .collect())
    }
}

/// Result of placing one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkAssignment {
    pub chunk_index: u32,
    pub assigned_peer: Option<PeerId>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

impl ChunkAssignment {
    pub fn assigned(chunk_index: u32, peer: PeerId) -> Self {
        Self {
            chunk_index,
            assigned_peer: Some(peer),
            success: true,
            failure_reason: None,
        }
    }

    pub fn unassigned(chunk_index: u32, reason: impl Into<String>) -> Self {
        Self {
            chunk_index,
            assigned_peer: None,
            success: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Why a peer was judged unfit to keep serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DegradationReason {
    HighErrorRate,
    Timeout,
    Disconnected,
    SlowThroughput,
}

impl DegradationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationReason::HighErrorRate => "high_error_rate",
            DegradationReason::Timeout => "timeout",
            DegradationReason::Disconnected => "disconnected",
            DegradationReason::SlowThroughput => "slow_throughput",
        }
    }
}

impl fmt::Display for DegradationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative importance of each cost-model signal. The four weights sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerWeights {
    pub reputation_weight: f64,
    pub throughput_weight: f64,
    pub rtt_weight: f64,
    pub recent_performance_weight: f64,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            reputation_weight: 0.30,
            throughput_weight: 0.30,
            rtt_weight: 0.20,
            recent_performance_weight: 0.20,
        }
    }
}

impl SchedulerWeights {
    /// Weights as an array in signal order (reputation, throughput, rtt, recent).
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.reputation_weight,
            self.throughput_weight,
            self.rtt_weight,
            self.recent_performance_weight,
        ]
    }

    pub fn from_array(values: [f64; 4]) -> Self {
        Self {
            reputation_weight: values[0],
            throughput_weight: values[1],
            rtt_weight: values[2],
            recent_performance_weight: values[3],
        }
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// True when every weight is in `[0, 1]` and they sum to one.
    pub fn is_normalized(&self) -> bool {
        self.as_array()
            .iter()
            .all(|w| w.is_finite() && (0.0..=1.0).contains(w))
            && (self.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
    }

    /// Clamps each weight to `[0, 1]` and rescales so they sum to one.
    ///
    /// Degenerate inputs (all zero or non-finite) fall back to the defaults.
    pub fn normalized(self) -> Self {
        let clamped = self.as_array().map(|w| {
            if w.is_finite() {
                w.clamp(0.0, 1.0)
            } else {
                0.0
            }
        });
        let total: f64 = clamped.iter().sum();
        if total <= f64::EPSILON {
            return Self::default();
        }
        Self::from_array(clamped.map(|w| w / total))
    }

    /// Weighted cost of a candidate; lower is better.
    pub fn cost_of(&self, signals: &CandidateSignals) -> f64 {
        self.as_array()
            .iter()
            .zip(signals.as_array())
            .map(|(weight, signal)| weight * signal)
            .sum()
    }
}

/// Errors raised when a chunk cannot be placed.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("No candidate peers supplied for chunk {chunk_index}")]
    NoCandidates { chunk_index: u32 },

    #[error("No eligible peer for chunk {chunk_index}: {reason}")]
    AllCandidatesIneligible { chunk_index: u32, reason: String },
}

/// Assignment surface shared by the base and adaptive schedulers.
///
/// Both implementations honour the same contract, so the orchestrator can be
/// wired with either.
#[async_trait]
pub trait ChunkScheduling: Send + Sync {
    /// Picks one peer for `request` and registers it as the chunk's owner.
    ///
    /// # Errors
    /// - `SchedulerError::NoCandidates` - `candidates` is empty
    /// - `SchedulerError::AllCandidatesIneligible` - every candidate is at
    ///   capacity, below the reputation floor, or excluded by the reputation policy
    async fn assign_chunk(
        &self,
        request: ChunkRequest,
        candidates: &[PeerId],
    ) -> Result<ChunkAssignment, SchedulerError>;

    /// Places several chunks. Output order matches input order; chunks that
    /// could not be placed come back with `success == false`.
    ///
    /// # Errors
    /// - `SchedulerError::NoCandidates` - `candidates` is empty
    async fn assign_multiple_chunks(
        &self,
        requests: &[ChunkRequest],
        candidates: &[PeerId],
    ) -> Result<Vec<ChunkAssignment>, SchedulerError>;

    /// Frees every chunk owned by `peer` and returns their indices, ascending.
    async fn handle_peer_degradation(&self, peer: &PeerId, reason: DegradationReason) -> Vec<u32>;

    /// Records `peer` as owner of `chunk_index`, replacing any previous owner.
    fn register_assignment(&self, chunk_index: u32, peer: PeerId);

    /// Drops the owner of `chunk_index`, returning it if there was one.
    fn unregister_assignment(&self, chunk_index: u32) -> Option<PeerId>;

    /// Current owner of `chunk_index`.
    fn assigned_peer(&self, chunk_index: u32) -> Option<PeerId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_plan_covers_file() {
        let plan = ChunkRequest::plan(2_500_000, 1_000_000).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2].offset, 2_000_000);
        assert_eq!(plan[2].size, 500_000);
        assert_eq!(plan.iter().map(|r| r.size).sum::<u64>(), 2_500_000);
    }

    #[test]
    fn test_chunk_plan_refuses_oversized_geometry() {
        assert_eq!(
            ChunkRequest::plan(u64::MAX, 1),
            Err(PieceMapError::TooManyChunks {
                file_size: u64::MAX,
                chunk_size: 1,
            })
        );
        assert_eq!(ChunkRequest::plan(10, 0), Err(PieceMapError::ZeroChunkSize));
    }

    #[test]
    fn test_chunk_request_past_end_is_none() {
        assert!(ChunkRequest::for_chunk(3, 1_000, 3_000).is_none());
        assert!(ChunkRequest::for_chunk(0, 0, 3_000).is_none());
    }

    #[test]
    fn test_default_weights_are_normalized() {
        assert!(SchedulerWeights::default().is_normalized());
    }

    #[test]
    fn test_normalize_rescales_and_clamps() {
        let weights = SchedulerWeights::from_array([2.0, 1.0, -0.5, 1.0]).normalized();
        assert!(weights.is_normalized());
        assert_eq!(weights.rtt_weight, 0.0);
        assert!((weights.reputation_weight - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_degenerate_falls_back_to_defaults() {
        let weights = SchedulerWeights::from_array([0.0, f64::NAN, 0.0, -1.0]).normalized();
        assert_eq!(weights, SchedulerWeights::default());
    }

    #[test]
    fn test_degradation_reason_display() {
        assert_eq!(DegradationReason::SlowThroughput.to_string(), "slow_throughput");
    }
}
