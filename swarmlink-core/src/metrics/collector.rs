//! In-memory peer metrics collection

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{ChunkOutcome, PeerMetricsProvider, PeerPerformanceMetrics};
use crate::peer::PeerId;

/// Smoothing factor applied to RTT and throughput samples
const SAMPLE_ALPHA: f64 = 0.3;

/// Exponential moving average for rate calculations
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    value: Option<f64>,
    alpha: f64,
}

impl ExponentialMovingAverage {
    /// Create new EMA with given smoothing factor
    pub fn new(alpha: f64) -> Self {
        Self { value: None, alpha }
    }

    /// Update the average with a new value. The first sample seeds the average.
    pub fn update(&mut self, new_value: f64) {
        self.value = Some(match self.value {
            Some(current) => self.alpha * new_value + (1.0 - self.alpha) * current,
            None => new_value,
        });
    }

    /// Current average, zero before the first sample
    pub fn current(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct PeerEntry {
    rtt: ExponentialMovingAverage,
    throughput: ExponentialMovingAverage,
    chunks_requested: u32,
    chunks_completed: u32,
    chunks_failed: u32,
    chunks_timed_out: u32,
    pinned_reputation: Option<f64>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            rtt: ExponentialMovingAverage::new(SAMPLE_ALPHA),
            throughput: ExponentialMovingAverage::new(SAMPLE_ALPHA),
            chunks_requested: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_timed_out: 0,
            pinned_reputation: None,
        }
    }

    /// Laplace-smoothed success ratio unless an external score was pinned.
    fn reputation(&self) -> f64 {
        if let Some(pinned) = self.pinned_reputation {
            return pinned;
        }
        let finished = self.chunks_completed + self.chunks_failed + self.chunks_timed_out;
        (self.chunks_completed as f64 + 1.0) / (finished as f64 + 2.0)
    }

    fn snapshot(&self, peer_id: &PeerId) -> PeerPerformanceMetrics {
        PeerPerformanceMetrics {
            peer_id: peer_id.clone(),
            rtt_avg_ms: self.rtt.current(),
            throughput_avg_bytes_per_sec: self.throughput.current(),
            chunks_requested: self.chunks_requested,
            chunks_completed: self.chunks_completed,
            chunks_failed: self.chunks_failed,
            chunks_timed_out: self.chunks_timed_out,
            reputation_score: self.reputation(),
        }
    }
}

/// Thread-safe per-peer metrics store.
///
/// The outer map is only write-locked to insert a new peer; updates take the
/// peer's own lock so concurrent transfers to different peers never contend.
#[derive(Debug, Default)]
pub struct PeerMetricsCollector {
    peers: RwLock<HashMap<PeerId, Arc<Mutex<PeerEntry>>>>,
}

impl PeerMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the derived reputation of a peer with an externally supplied score.
    pub fn set_reputation(&self, peer: &PeerId, score: f64) {
        self.entry(peer).lock().pinned_reputation = Some(score.clamp(0.0, 1.0));
    }

    /// Number of peers with recorded activity.
    pub fn tracked_peers(&self) -> usize {
        self.peers.read().len()
    }

    fn entry(&self, peer: &PeerId) -> Arc<Mutex<PeerEntry>> {
        if let Some(entry) = self.peers.read().get(peer) {
            return Arc::clone(entry);
        }
        let mut peers = self.peers.write();
        Arc::clone(
            peers
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(Mutex::new(PeerEntry::new()))),
        )
    }
}

impl PeerMetricsProvider for PeerMetricsCollector {
    fn metrics(&self, peer: &PeerId) -> Option<PeerPerformanceMetrics> {
        let entry = self.peers.read().get(peer).cloned()?;
        let snapshot = entry.lock().snapshot(peer);
        Some(snapshot)
    }

    fn record_chunk_requested(&self, peer: &PeerId) {
        self.entry(peer).lock().chunks_requested += 1;
    }

    fn record_chunk_completion(&self, peer: &PeerId, outcome: ChunkOutcome) {
        let entry = self.entry(peer);
        let mut entry = entry.lock();

        if outcome.success {
            entry.chunks_completed += 1;
            if outcome.duration_ms > 0 {
                let rate = outcome.bytes as f64 * 1000.0 / outcome.duration_ms as f64;
                entry.throughput.update(rate);
            }
        } else if outcome.timed_out {
            entry.chunks_timed_out += 1;
        } else {
            entry.chunks_failed += 1;
        }
    }

    fn record_rtt_sample(&self, peer: &PeerId, rtt_ms: f64) {
        self.entry(peer).lock().rtt.update(rtt_ms);
    }

    fn record_throughput_sample(&self, peer: &PeerId, bytes_per_sec: f64) {
        self.entry(peer).lock().throughput.update(bytes_per_sec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_seeds_with_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.current(), 0.0);
        ema.update(100.0);
        assert_eq!(ema.current(), 100.0);
        ema.update(200.0);
        assert_eq!(ema.current(), 150.0);
    }

    #[test]
    fn test_unknown_peer_has_no_metrics() {
        let collector = PeerMetricsCollector::new();
        assert!(collector.metrics(&PeerId::new("ghost")).is_none());
    }

    #[test]
    fn test_outcomes_update_counters_and_reputation() {
        let collector = PeerMetricsCollector::new();
        let peer = PeerId::new("p1");

        for _ in 0..4 {
            collector.record_chunk_requested(&peer);
        }
        collector.record_chunk_completion(&peer, ChunkOutcome::succeeded(1_000, 1_000_000));
        collector.record_chunk_completion(&peer, ChunkOutcome::succeeded(500, 1_000_000));
        collector.record_chunk_completion(&peer, ChunkOutcome::failed(200));
        collector.record_chunk_completion(&peer, ChunkOutcome::timed_out(30_000));

        let metrics = collector.metrics(&peer).unwrap();
        assert_eq!(metrics.chunks_requested, 4);
        assert_eq!(metrics.chunks_completed, 2);
        assert_eq!(metrics.chunks_failed, 1);
        assert_eq!(metrics.chunks_timed_out, 1);
        // (2 + 1) / (4 + 2)
        assert!((metrics.reputation_score - 0.5).abs() < 1e-9);
        // 1 MB/s seeded, then 2 MB/s with alpha 0.3
        assert!((metrics.throughput_avg_bytes_per_sec - 1_300_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_pinned_reputation_overrides_derived() {
        let collector = PeerMetricsCollector::new();
        let peer = PeerId::new("p1");
        collector.set_reputation(&peer, 1.7);
        assert_eq!(collector.metrics(&peer).unwrap().reputation_score, 1.0);
    }

    #[test]
    fn test_rtt_samples_are_smoothed() {
        let collector = PeerMetricsCollector::new();
        let peer = PeerId::new("p1");
        collector.record_rtt_sample(&peer, 100.0);
        collector.record_rtt_sample(&peer, 200.0);
        let rtt = collector.metrics(&peer).unwrap().rtt_avg_ms;
        assert!((rtt - 130.0).abs() < 1e-9);
        assert_eq!(collector.tracked_peers(), 1);
    }
}
