//! Peer reputation and offer admission
//!
//! Tracks failure patterns per peer and temporarily blacklists peers that
//! keep failing or serve content that does not verify. Transfers consult the
//! policy before accepting an offer and report failures back to it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::peer::{ContentId, PeerId, VariantId};

/// Maximum consecutive failures before blacklisting a peer temporarily
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Temporary blacklist duration for problematic peers
const PEER_BLACKLIST_DURATION: Duration = Duration::from_secs(300); // 5 minutes

/// Why a peer is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureReason {
    /// Assembled file failed whole-file or fingerprint verification
    VerificationFailed,
    Disconnected,
    IdleTimeout,
    /// A single chunk was malformed or failed its integrity tag
    ChunkFailure,
    PolicyViolation,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationFailed => "verification_failed",
            Self::Disconnected => "disconnected",
            Self::IdleTimeout => "idle_timeout",
            Self::ChunkFailure => "chunk_failure",
            Self::PolicyViolation => "policy_violation",
        }
    }

    /// Failures serious enough to blacklist on the first occurrence.
    fn is_immediately_blacklisting(&self) -> bool {
        matches!(self, Self::VerificationFailed | Self::PolicyViolation)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transfer is willing to accept from an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferConstraints {
    pub content_id: ContentId,
    pub variant_id: VariantId,
    /// Quality advertised by the offering peer
    pub offered_quality: u32,
    /// Lowest quality the transfer will accept
    pub min_quality: u32,
}

/// Fairness and reputation collaborator consulted around offers.
#[async_trait]
pub trait ReputationPolicy: Send + Sync {
    /// Whether an offer from `peer` under `constraints` may be accepted.
    async fn can_accept_offer(&self, peer: &PeerId, constraints: &OfferConstraints) -> bool;

    /// Reports a failure attributable to `peer`.
    async fn record_failure(&self, peer: &PeerId, reason: FailureReason);

    /// Reports a successfully completed transfer from `peer`.
    async fn record_success(&self, _peer: &PeerId) {}

    /// Whether `peer` must not be given new chunks right now.
    fn is_excluded(&self, _peer: &PeerId) -> bool {
        false
    }
}

/// Information about peer failures for blacklisting decisions
#[derive(Debug, Clone)]
pub struct PeerFailureInfo {
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub last_failure: Instant,
    pub last_reason: FailureReason,
    /// Number of times this peer has been blacklisted
    pub offences: u32,
    pub blacklisted_until: Option<Instant>,
}

impl PeerFailureInfo {
    fn new(reason: FailureReason) -> Self {
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            last_failure: Instant::now(),
            last_reason: reason,
            offences: 0,
            blacklisted_until: None,
        }
    }

    /// Check if peer should be temporarily blacklisted
    pub fn should_blacklist(&self) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            || self.last_reason.is_immediately_blacklisting()
    }

    /// Blacklist duration for the next offence; doubles per repeat, capped at 8x.
    pub fn calculate_blacklist_duration(&self) -> Duration {
        let multiplier = match self.offences {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 8,
        };
        PEER_BLACKLIST_DURATION * multiplier
    }

    fn is_blacklisted_at(&self, now: Instant) -> bool {
        self.blacklisted_until.is_some_and(|expiry| now < expiry)
    }
}

/// Statistics about tracked peers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationStats {
    pub tracked_peers: usize,
    pub blacklisted_peers: usize,
    pub total_failures: u32,
}

/// In-memory [`ReputationPolicy`] with temporary blacklisting.
#[derive(Debug, Default)]
pub struct PeerReputationTracker {
    peers: Mutex<HashMap<PeerId, PeerFailureInfo>>,
}

impl PeerReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and blacklists the peer if the pattern warrants it.
    pub fn note_failure(&self, peer: &PeerId, reason: FailureReason) {
        let mut peers = self.peers.lock();
        let info = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerFailureInfo::new(reason));

        info.consecutive_failures += 1;
        info.total_failures += 1;
        info.last_failure = Instant::now();
        info.last_reason = reason;

        if info.should_blacklist() && !info.is_blacklisted_at(info.last_failure) {
            let duration = info.calculate_blacklist_duration();
            info.blacklisted_until = Some(info.last_failure + duration);
            info.offences += 1;

            tracing::warn!(
                peer = %peer,
                reason = %reason,
                "Temporarily blacklisting peer for {} seconds",
                duration.as_secs()
            );
        }
    }

    /// Resets the consecutive failure counter. An active blacklist still
    /// runs until it expires.
    pub fn note_success(&self, peer: &PeerId) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.consecutive_failures = 0;
        }
    }

    /// Check if peer is currently blacklisted
    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.peers
            .lock()
            .get(peer)
            .is_some_and(|info| info.is_blacklisted_at(Instant::now()))
    }

    /// Failure record for `peer`, if any.
    pub fn failure_info(&self, peer: &PeerId) -> Option<PeerFailureInfo> {
        self.peers.lock().get(peer).cloned()
    }

    /// Currently blacklisted peers, sorted.
    pub fn blacklisted_peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut blacklisted: Vec<PeerId> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, info)| info.is_blacklisted_at(now))
            .map(|(peer, _)| peer.clone())
            .collect();
        blacklisted.sort();
        blacklisted
    }

    pub fn stats(&self) -> ReputationStats {
        let now = Instant::now();
        let peers = self.peers.lock();
        ReputationStats {
            tracked_peers: peers.len(),
            blacklisted_peers: peers
                .values()
                .filter(|info| info.is_blacklisted_at(now))
                .count(),
            total_failures: peers.values().map(|info| info.total_failures).sum(),
        }
    }

    /// Clean up expired entries to prevent memory leaks
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.peers.lock().retain(|_, info| {
            info.is_blacklisted_at(now) || info.consecutive_failures > 0
        });
    }
}

#[async_trait]
impl ReputationPolicy for PeerReputationTracker {
    async fn can_accept_offer(&self, peer: &PeerId, constraints: &OfferConstraints) -> bool {
        if self.is_blacklisted(peer) {
            tracing::debug!(peer = %peer, "Refusing offer from blacklisted peer");
            return false;
        }
        if constraints.offered_quality < constraints.min_quality {
            tracing::debug!(
                peer = %peer,
                offered = constraints.offered_quality,
                required = constraints.min_quality,
                "Refusing offer below minimum quality"
            );
            return false;
        }
        true
    }

    async fn record_failure(&self, peer: &PeerId, reason: FailureReason) {
        self.note_failure(peer, reason);
    }

    async fn record_success(&self, peer: &PeerId) {
        self.note_success(peer);
    }

    fn is_excluded(&self, peer: &PeerId) -> bool {
        self.is_blacklisted(peer)
    }
}
