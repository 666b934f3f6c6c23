//! Per-peer transport quality metrics consumed by the scheduler
//!
//! The scheduler only reads snapshots through [`PeerMetricsProvider`]; outcome
//! reports flow in from transfers. [`PeerMetricsCollector`] is the in-memory
//! implementation used when no external collector is wired in.

pub mod collector;

use serde::{Deserialize, Serialize};

pub use collector::{ExponentialMovingAverage, PeerMetricsCollector};

use crate::peer::PeerId;

/// Snapshot of one peer's performance within the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPerformanceMetrics {
    pub peer_id: PeerId,
    /// Smoothed round-trip time in milliseconds
    pub rtt_avg_ms: f64,
    /// Smoothed throughput in bytes per second
    pub throughput_avg_bytes_per_sec: f64,
    pub chunks_requested: u32,
    pub chunks_completed: u32,
    pub chunks_failed: u32,
    pub chunks_timed_out: u32,
    /// Reputation in `[0, 1]`, higher is better
    pub reputation_score: f64,
}

impl PeerPerformanceMetrics {
    /// Metrics for a peer we have never requested anything from.
    pub fn unknown(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            rtt_avg_ms: 0.0,
            throughput_avg_bytes_per_sec: 0.0,
            chunks_requested: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_timed_out: 0,
            reputation_score: 0.5,
        }
    }

    /// True when the peer has served at least one request.
    pub fn has_history(&self) -> bool {
        self.chunks_requested > 0
    }

    /// True once at least one RTT sample was recorded. Averages read zero
    /// until the first sample arrives.
    pub fn has_rtt_sample(&self) -> bool {
        self.rtt_avg_ms > 0.0
    }

    /// True once at least one throughput sample was recorded.
    pub fn has_throughput_sample(&self) -> bool {
        self.throughput_avg_bytes_per_sec > 0.0
    }

    /// Fraction of requests that failed or timed out, in `[0, 1]`.
    pub fn recent_failure_rate(&self) -> f64 {
        if self.chunks_requested == 0 {
            return 0.0;
        }
        let bad = (self.chunks_failed + self.chunks_timed_out) as f64;
        (bad / self.chunks_requested as f64).clamp(0.0, 1.0)
    }
}

/// Observed result of one chunk request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub bytes: u64,
}

impl ChunkOutcome {
    pub fn succeeded(duration_ms: u64, bytes: u64) -> Self {
        Self {
            success: true,
            timed_out: false,
            duration_ms,
            bytes,
        }
    }

    pub fn failed(duration_ms: u64) -> Self {
        Self {
            success: false,
            timed_out: false,
            duration_ms,
            bytes: 0,
        }
    }

    pub fn timed_out(duration_ms: u64) -> Self {
        Self {
            success: false,
            timed_out: true,
            duration_ms,
            bytes: 0,
        }
    }
}

/// Source of per-peer metrics snapshots and sink for outcome reports.
///
/// Implementations need only per-peer atomicity; no invariant spans peers.
pub trait PeerMetricsProvider: Send + Sync {
    /// Snapshot for `peer`, or `None` if the peer is unknown.
    fn metrics(&self, peer: &PeerId) -> Option<PeerPerformanceMetrics>;

    /// Notes that a chunk request was issued to `peer`.
    fn record_chunk_requested(&self, peer: &PeerId);

    /// Records the outcome of a chunk request.
    fn record_chunk_completion(&self, peer: &PeerId, outcome: ChunkOutcome);

    fn record_rtt_sample(&self, peer: &PeerId, rtt_ms: f64);

    fn record_throughput_sample(&self, peer: &PeerId, bytes_per_sec: f64);
}
