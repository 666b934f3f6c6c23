//! Downloader-side transfer state machine
//!
//! [`Transfer::handle`] is the only way state changes. It consumes one
//! [`TransferEvent`] and returns the [`TransferAction`]s the driver must
//! carry out, without touching the network or the disk itself. Events that
//! are meaningless in the current state are either ignored (late messages,
//! stale timers) or rejected with `InvalidTransition` (caller bugs).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TransferError;
use crate::config::TransferConfig;
use crate::peer::{ContentId, JobId, PeerId, TransferId, VariantId};
use crate::piece_map::{ChunkState, PieceMap};
use crate::reputation::FailureReason;
use crate::scheduler::ChunkRequest;
use crate::transport::{ChunkResponse, Offer};
use crate::verification::{VerificationOutcome, sha1_hex};

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    New,
    Negotiating,
    Ready,
    Requesting,
    Draining,
    Verifying,
    Completed,
    Aborted(AbortReason),
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Requesting => "requesting",
            Self::Draining => "draining",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Aborted(_) => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted(_))
    }

    /// States in which chunk requests may be outstanding.
    pub fn is_transferring(&self) -> bool {
        matches!(self, Self::Requesting | Self::Draining)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(reason) => write!(f, "aborted({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Why a transfer ended in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AbortReason {
    NegotiationTimeout,
    NoAcceptableOffer,
    VerificationFailed,
    PeerDisconnected,
    IdleTimeout,
    Cancelled,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NegotiationTimeout => "negotiation_timeout",
            Self::NoAcceptableOffer => "no_acceptable_offer",
            Self::VerificationFailed => "verification_failed",
            Self::PeerDisconnected => "peer_disconnected",
            Self::IdleTimeout => "idle_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Begin negotiation
    Start,
    /// An offer arrived; `policy_accepted` is the reputation policy's verdict
    OfferReceived { offer: Offer, policy_accepted: bool },
    NegotiationTimedOut,
    /// Scheduler handed this transfer more chunks to fetch
    ChunksAssigned(Vec<ChunkRequest>),
    ChunkReceived(ChunkResponse),
    /// Data for a received chunk reached local storage
    ChunkPersisted { chunk_index: u32 },
    /// A chunk could not be fetched or stored
    ChunkFailed { chunk_index: u32, reason: String },
    /// The listed chunks are now owned by other peers
    Rebalance { reassigned: Vec<u32> },
    /// Other transfers completed these chunks of the same file
    ChunksCompletedElsewhere(Vec<u32>),
    VerificationFinished(VerificationOutcome),
    PeerDisconnected,
    IdleTimedOut,
    Cancelled,
}

impl TransferEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::OfferReceived { .. } => "offer_received",
            Self::NegotiationTimedOut => "negotiation_timed_out",
            Self::ChunksAssigned(_) => "chunks_assigned",
            Self::ChunkReceived(_) => "chunk_received",
            Self::ChunkPersisted { .. } => "chunk_persisted",
            Self::ChunkFailed { .. } => "chunk_failed",
            Self::Rebalance { .. } => "rebalance",
            Self::ChunksCompletedElsewhere(_) => "chunks_completed_elsewhere",
            Self::VerificationFinished(_) => "verification_finished",
            Self::PeerDisconnected => "peer_disconnected",
            Self::IdleTimedOut => "idle_timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferAction {
    SendOfferRequest,
    NotifyReady {
        peer_id: PeerId,
        variant_id: VariantId,
        file_size: u64,
    },
    SendChunkRequest(ChunkRequest),
    ResetIdleTimer,
    PersistChunk {
        chunk_index: u32,
        offset: u64,
        data: Bytes,
    },
    RecordChunkOutcome {
        chunk_index: u32,
        success: bool,
        bytes: u64,
    },
    /// Best-effort cancel of outstanding chunk requests
    SendCancel { chunk_indices: Vec<u32> },
    SendCancelTransfer,
    /// Chunks this transfer no longer fetches; ownership goes back to the scheduler
    ReleaseChunks {
        chunk_indices: Vec<u32>,
        reason: String,
    },
    BeginVerification,
    SendCompletion,
    DiscardLocalData,
    ReportFailure(FailureReason),
    ReportSuccess,
    NotifyCompleted,
    NotifyAborted(AbortReason),
}

/// Peer and variant a transfer committed to after negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferBinding {
    pub peer_id: PeerId,
    pub variant_id: VariantId,
    pub file_size: u64,
}

/// Point-in-time view of a transfer's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub state: TransferState,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub in_flight_chunks: usize,
    /// Bytes received from this transfer's peer
    pub bytes_received: u64,
    pub file_size: Option<u64>,
}

/// One downloader session with one peer.
#[derive(Debug, Clone)]
pub struct Transfer {
    id: TransferId,
    job_id: JobId,
    content_id: ContentId,
    chunk_size: u64,
    pipeline_depth: usize,
    min_quality: u32,
    state: TransferState,
    binding: Option<TransferBinding>,
    piece_map: Option<PieceMap>,
    queued: VecDeque<ChunkRequest>,
    in_flight: BTreeMap<u32, ChunkRequest>,
    persisting: BTreeMap<u32, ChunkRequest>,
    received_here: BTreeSet<u32>,
    bytes_received: u64,
    rejected_offers: u32,
    created_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn new(job_id: JobId, content_id: ContentId, config: &TransferConfig) -> Self {
        Self {
            id: TransferId::generate(),
            job_id,
            content_id,
            chunk_size: config.chunk_size,
            pipeline_depth: config.pipeline_depth.max(1),
            min_quality: config.min_offer_quality,
            state: TransferState::New,
            binding: None,
            piece_map: None,
            queued: VecDeque::new(),
            in_flight: BTreeMap::new(),
            persisting: BTreeMap::new(),
            received_here: BTreeSet::new(),
            bytes_received: 0,
            rejected_offers: 0,
            created_at: Utc::now(),
            ready_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn binding(&self) -> Option<&TransferBinding> {
        self.binding.as_ref()
    }

    pub fn bound_peer(&self) -> Option<&PeerId> {
        self.binding.as_ref().map(|b| &b.peer_id)
    }

    pub fn piece_map(&self) -> Option<&PieceMap> {
        self.piece_map.as_ref()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self.state {
            TransferState::Aborted(reason) => Some(reason),
            _ => None,
        }
    }

    /// Chunks requested from the peer and not yet answered, ascending.
    pub fn in_flight_chunks(&self) -> Vec<u32> {
        self.in_flight.keys().copied().collect()
    }

    /// Assigned chunks waiting for a pipeline slot.
    pub fn queued_chunks(&self) -> Vec<u32> {
        self.queued.iter().map(|r| r.chunk_index).collect()
    }

    /// Chunk request previously issued for `chunk_index`, if still outstanding.
    pub fn outstanding_request(&self, chunk_index: u32) -> Option<&ChunkRequest> {
        self.in_flight.get(&chunk_index)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.ready_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            state: self.state,
            total_chunks: self.piece_map.as_ref().map_or(0, PieceMap::chunk_count),
            completed_chunks: self.piece_map.as_ref().map_or(0, PieceMap::completed_chunks),
            in_flight_chunks: self.in_flight.len() + self.persisting.len(),
            bytes_received: self.bytes_received,
            file_size: self.binding.as_ref().map(|b| b.file_size),
        }
    }

    /// Error describing how this transfer ended, `None` unless aborted.
    pub fn abort_error(&self) -> Option<TransferError> {
        self.abort_reason().map(TransferError::from)
    }

    /// Applies one event.
    ///
    /// # Errors
    /// - `TransferError::InvalidTransition` - Event cannot occur in the current state
    pub fn handle(&mut self, event: TransferEvent) -> Result<Vec<TransferAction>, TransferError> {
        let before = self.state;
        let event_name = event.name();

        let actions = match event {
            TransferEvent::Start => self.on_start()?,
            TransferEvent::OfferReceived {
                offer,
                policy_accepted,
            } => self.on_offer(offer, policy_accepted),
            TransferEvent::NegotiationTimedOut => self.on_negotiation_timeout(),
            TransferEvent::ChunksAssigned(requests) => self.on_assigned(requests)?,
            TransferEvent::ChunkReceived(response) => self.on_chunk_received(response),
            TransferEvent::ChunkPersisted { chunk_index } => self.on_chunk_persisted(chunk_index),
            TransferEvent::ChunkFailed {
                chunk_index,
                reason,
            } => self.on_chunk_failed(chunk_index, reason),
            TransferEvent::Rebalance { reassigned } => self.on_rebalance(reassigned)?,
            TransferEvent::ChunksCompletedElsewhere(indices) => {
                self.on_completed_elsewhere(indices)
            }
            TransferEvent::VerificationFinished(outcome) => self.on_verification(outcome)?,
            TransferEvent::PeerDisconnected => self.on_peer_disconnected(),
            TransferEvent::IdleTimedOut => self.on_idle_timeout(),
            TransferEvent::Cancelled => self.on_cancel(),
        };

        if before != self.state {
            tracing::info!(
                transfer_id = %self.id,
                from = %before,
                to = %self.state,
                event = event_name,
                "Transfer state changed"
            );
        }
        Ok(actions)
    }

    fn invalid(&self, event: &'static str) -> TransferError {
        TransferError::InvalidTransition {
            state: self.state.as_str(),
            event,
        }
    }

    fn on_start(&mut self) -> Result<Vec<TransferAction>, TransferError> {
        if self.state != TransferState::New {
            return Err(self.invalid("start"));
        }
        self.state = TransferState::Negotiating;
        Ok(vec![TransferAction::SendOfferRequest])
    }

    fn on_offer(&mut self, offer: Offer, policy_accepted: bool) -> Vec<TransferAction> {
        if self.state != TransferState::Negotiating {
            tracing::debug!(transfer_id = %self.id, peer = %offer.peer_id, "Ignoring late offer");
            return Vec::new();
        }

        let compatible = policy_accepted
            && offer.transfer_id == self.id
            && offer.content_id == self.content_id
            && offer.quality >= self.min_quality
            && offer.file_size > 0;
        let piece_map = match PieceMap::new(offer.file_size, self.chunk_size) {
            Ok(map) if compatible => map,
            _ => {
                self.rejected_offers += 1;
                tracing::debug!(
                    transfer_id = %self.id,
                    peer = %offer.peer_id,
                    variant = %offer.variant_id,
                    "Rejected offer"
                );
                return Vec::new();
            }
        };

        let binding = TransferBinding {
            peer_id: offer.peer_id,
            variant_id: offer.variant_id,
            file_size: offer.file_size,
        };
        let action = TransferAction::NotifyReady {
            peer_id: binding.peer_id.clone(),
            variant_id: binding.variant_id.clone(),
            file_size: binding.file_size,
        };

        self.binding = Some(binding);
        self.piece_map = Some(piece_map);
        self.state = TransferState::Ready;
        self.ready_at = Some(Utc::now());
        vec![action]
    }

    fn on_negotiation_timeout(&mut self) -> Vec<TransferAction> {
        if self.state != TransferState::Negotiating {
            return Vec::new();
        }
        let reason = if self.rejected_offers > 0 {
            AbortReason::NoAcceptableOffer
        } else {
            AbortReason::NegotiationTimeout
        };
        self.abort(reason, None, false)
    }

    fn on_assigned(
        &mut self,
        requests: Vec<ChunkRequest>,
    ) -> Result<Vec<TransferAction>, TransferError> {
        if !matches!(
            self.state,
            TransferState::Ready | TransferState::Requesting | TransferState::Draining
        ) {
            return Err(self.invalid("chunks_assigned"));
        }
        let Some(piece_map) = self.piece_map.as_ref() else {
            return Err(self.invalid("chunks_assigned"));
        };

        for request in requests {
            let index = request.chunk_index;
            let matches_geometry =
                piece_map.chunk_range(index) == Some((request.offset, request.size));
            let missing = piece_map.state(index) == Some(ChunkState::Missing);
            let already_queued = self.queued.iter().any(|r| r.chunk_index == index);

            if matches_geometry && missing && !already_queued {
                self.queued.push_back(request);
            } else {
                tracing::debug!(
                    transfer_id = %self.id,
                    chunk = index,
                    "Skipping unusable assignment"
                );
            }
        }

        let mut actions = Vec::new();
        if self.state != TransferState::Requesting {
            self.state = TransferState::Requesting;
            actions.push(TransferAction::ResetIdleTimer);
        }
        self.fill_pipeline(&mut actions);
        // Every assignment may have been for chunks that landed elsewhere.
        self.check_drained(&mut actions);
        Ok(actions)
    }

    fn fill_pipeline(&mut self, actions: &mut Vec<TransferAction>) {
        if self.state != TransferState::Requesting {
            return;
        }
        let Some(piece_map) = self.piece_map.as_mut() else {
            return;
        };

        while self.in_flight.len() < self.pipeline_depth {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            if let Ok(true) = piece_map.mark_in_flight(request.chunk_index) {
                self.in_flight.insert(request.chunk_index, request);
                actions.push(TransferAction::SendChunkRequest(request));
            }
        }
    }

    fn on_chunk_received(&mut self, response: ChunkResponse) -> Vec<TransferAction> {
        if !self.state.is_transferring() || response.transfer_id != self.id {
            return Vec::new();
        }

        let index = response.chunk_index;
        let Some(request) = self.in_flight.get(&index).copied() else {
            // Duplicate, cancelled, or never requested
            tracing::debug!(
                transfer_id = %self.id,
                chunk = index,
                "Discarding unsolicited chunk response"
            );
            return Vec::new();
        };

        if let Some(error) = response.error {
            let error = TransferError::ChunkIo {
                chunk_index: index,
                reason: error,
            };
            return self.fail_chunk(index, error, false);
        }

        if response.offset != request.offset
            || response.length != request.size
            || response.data.len() as u64 != request.size
        {
            let error = TransferError::ChunkIo {
                chunk_index: index,
                reason: format!(
                    "malformed response: offset {} length {} with {} bytes, expected offset {} length {}",
                    response.offset,
                    response.length,
                    response.data.len(),
                    request.offset,
                    request.size
                ),
            };
            return self.fail_chunk(index, error, true);
        }

        if let Some(tag) = response.integrity.as_deref()
            && !sha1_hex(&response.data).eq_ignore_ascii_case(tag)
        {
            let error = TransferError::ChunkHashMismatch { chunk_index: index };
            return self.fail_chunk(index, error, true);
        }

        self.in_flight.remove(&index);
        self.persisting.insert(index, request);

        let mut actions = vec![
            TransferAction::ResetIdleTimer,
            TransferAction::PersistChunk {
                chunk_index: index,
                offset: request.offset,
                data: response.data,
            },
        ];
        self.fill_pipeline(&mut actions);
        actions
    }

    fn on_chunk_persisted(&mut self, index: u32) -> Vec<TransferAction> {
        if !self.state.is_transferring() {
            return Vec::new();
        }
        let Some(request) = self.persisting.remove(&index) else {
            return Vec::new();
        };
        let Some(piece_map) = self.piece_map.as_mut() else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if let Ok(true) = piece_map.mark_complete(index) {
            self.received_here.insert(index);
            self.bytes_received += request.size;
            actions.push(TransferAction::RecordChunkOutcome {
                chunk_index: index,
                success: true,
                bytes: request.size,
            });
        }
        self.check_drained(&mut actions);
        actions
    }

    fn on_chunk_failed(&mut self, index: u32, reason: String) -> Vec<TransferAction> {
        if !self.state.is_transferring() {
            return Vec::new();
        }
        let error = TransferError::ChunkIo {
            chunk_index: index,
            reason,
        };
        self.fail_chunk(index, error, false)
    }

    /// Returns a single chunk to `Missing` without disturbing the rest of the transfer.
    fn fail_chunk(
        &mut self,
        index: u32,
        error: TransferError,
        peer_at_fault: bool,
    ) -> Vec<TransferAction> {
        let was_outstanding =
            self.in_flight.remove(&index).is_some() || self.persisting.remove(&index).is_some();
        if !was_outstanding {
            return Vec::new();
        }
        if let Some(piece_map) = self.piece_map.as_mut() {
            let _ = piece_map.mark_missing(index);
        }

        tracing::debug!(transfer_id = %self.id, chunk = index, "Chunk failed: {error}");

        let mut actions = vec![
            TransferAction::ResetIdleTimer,
            TransferAction::RecordChunkOutcome {
                chunk_index: index,
                success: false,
                bytes: 0,
            },
            TransferAction::ReleaseChunks {
                chunk_indices: vec![index],
                reason: error.to_string(),
            },
        ];
        if peer_at_fault {
            actions.push(TransferAction::ReportFailure(FailureReason::ChunkFailure));
        }
        self.fill_pipeline(&mut actions);
        actions
    }

    fn on_rebalance(&mut self, reassigned: Vec<u32>) -> Result<Vec<TransferAction>, TransferError> {
        match self.state {
            TransferState::New | TransferState::Negotiating => {
                return Err(self.invalid("rebalance"));
            }
            TransferState::Ready | TransferState::Requesting | TransferState::Draining => {}
            _ => return Ok(Vec::new()),
        }

        // Nothing new is issued while draining, so every queued chunk goes back.
        let mut released: Vec<u32> = self.queued.drain(..).map(|r| r.chunk_index).collect();
        let mut cancelled = Vec::new();
        for index in reassigned {
            if self.in_flight.remove(&index).is_some() {
                if let Some(piece_map) = self.piece_map.as_mut() {
                    let _ = piece_map.mark_missing(index);
                }
                cancelled.push(index);
                released.push(index);
            }
        }
        released.sort_unstable();
        released.dedup();

        self.state = TransferState::Draining;

        let mut actions = Vec::new();
        if !cancelled.is_empty() {
            actions.push(TransferAction::SendCancel {
                chunk_indices: cancelled,
            });
        }
        if !released.is_empty() {
            actions.push(TransferAction::ReleaseChunks {
                chunk_indices: released,
                reason: "rebalanced".to_string(),
            });
        }
        self.check_drained(&mut actions);
        Ok(actions)
    }

    fn on_completed_elsewhere(&mut self, indices: Vec<u32>) -> Vec<TransferAction> {
        if !matches!(
            self.state,
            TransferState::Ready | TransferState::Requesting | TransferState::Draining
        ) {
            return Vec::new();
        }
        let Some(piece_map) = self.piece_map.as_mut() else {
            return Vec::new();
        };

        let mut cancelled = Vec::new();
        for index in indices {
            self.queued.retain(|r| r.chunk_index != index);
            if self.in_flight.remove(&index).is_some() {
                cancelled.push(index);
            }
            if self.persisting.contains_key(&index) {
                // Our own copy is about to land; let it complete normally.
                continue;
            }
            let _ = piece_map.mark_complete(index);
        }

        let mut actions = Vec::new();
        if !cancelled.is_empty() {
            actions.push(TransferAction::SendCancel {
                chunk_indices: cancelled,
            });
        }
        self.fill_pipeline(&mut actions);
        self.check_drained(&mut actions);
        actions
    }

    /// Moves to verification once nothing is missing or outstanding. A ready
    /// transfer qualifies too, since other transfers may fill its map first.
    fn check_drained(&mut self, actions: &mut Vec<TransferAction>) {
        let drained = self.piece_map.as_ref().is_some_and(PieceMap::is_drained);
        let eligible = self.state.is_transferring() || self.state == TransferState::Ready;
        if drained && eligible {
            self.state = TransferState::Verifying;
            actions.push(TransferAction::BeginVerification);
        }
    }

    fn on_verification(
        &mut self,
        outcome: VerificationOutcome,
    ) -> Result<Vec<TransferAction>, TransferError> {
        if self.state != TransferState::Verifying {
            return Err(self.invalid("verification_finished"));
        }

        match outcome {
            VerificationOutcome::Passed | VerificationOutcome::NotApplicable => {
                self.state = TransferState::Completed;
                self.finished_at = Some(Utc::now());
                Ok(vec![
                    TransferAction::SendCompletion,
                    TransferAction::ReportSuccess,
                    TransferAction::NotifyCompleted,
                ])
            }
            VerificationOutcome::Failed { reason } => {
                tracing::warn!(transfer_id = %self.id, "Verification failed: {reason}");
                self.discard_progress();
                self.state = TransferState::Aborted(AbortReason::VerificationFailed);
                self.finished_at = Some(Utc::now());
                Ok(vec![
                    TransferAction::DiscardLocalData,
                    TransferAction::ReportFailure(FailureReason::VerificationFailed),
                    TransferAction::NotifyAborted(AbortReason::VerificationFailed),
                ])
            }
        }
    }

    /// Forgets every received chunk after local data has been thrown away.
    fn discard_progress(&mut self) {
        if let Some(piece_map) = self.piece_map.as_mut() {
            for index in 0..piece_map.chunk_count() {
                let _ = piece_map.mark_missing(index);
            }
        }
        self.received_here.clear();
        self.bytes_received = 0;
    }

    fn on_peer_disconnected(&mut self) -> Vec<TransferAction> {
        match self.state {
            // All data is local; verification does not need the peer.
            TransferState::Verifying => Vec::new(),
            state if state.is_terminal() => Vec::new(),
            _ => self.abort(
                AbortReason::PeerDisconnected,
                Some(FailureReason::Disconnected),
                false,
            ),
        }
    }

    fn on_idle_timeout(&mut self) -> Vec<TransferAction> {
        if !self.state.is_transferring() {
            return Vec::new();
        }
        self.abort(AbortReason::IdleTimeout, Some(FailureReason::IdleTimeout), true)
    }

    fn on_cancel(&mut self) -> Vec<TransferAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.abort(AbortReason::Cancelled, None, true)
    }

    fn abort(
        &mut self,
        reason: AbortReason,
        report: Option<FailureReason>,
        notify_peer: bool,
    ) -> Vec<TransferAction> {
        let mut released: Vec<u32> = self.queued.drain(..).map(|r| r.chunk_index).collect();
        let outstanding: Vec<u32> = self
            .in_flight
            .keys()
            .chain(self.persisting.keys())
            .copied()
            .collect();
        self.in_flight.clear();
        self.persisting.clear();
        if let Some(piece_map) = self.piece_map.as_mut() {
            for index in &outstanding {
                let _ = piece_map.mark_missing(*index);
            }
        }
        released.extend(outstanding);
        released.sort_unstable();
        released.dedup();

        let mut actions = Vec::new();
        if notify_peer && self.state != TransferState::New {
            actions.push(TransferAction::SendCancelTransfer);
        }
        if !released.is_empty() {
            actions.push(TransferAction::ReleaseChunks {
                chunk_indices: released,
                reason: reason.as_str().to_string(),
            });
        }
        if let Some(failure) = report
            && self.binding.is_some()
        {
            actions.push(TransferAction::ReportFailure(failure));
        }
        actions.push(TransferAction::NotifyAborted(reason));

        self.state = TransferState::Aborted(reason);
        self.finished_at = Some(Utc::now());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 1_000_000;

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: CHUNK,
            pipeline_depth: 2,
            ..TransferConfig::default()
        }
    }

    fn new_transfer() -> Transfer {
        Transfer::new(JobId::new("job"), ContentId::new("movie"), &config())
    }

    fn offer_for(transfer: &Transfer, file_size: u64) -> Offer {
        Offer {
            peer_id: PeerId::new("seeder"),
            transfer_id: transfer.id(),
            content_id: ContentId::new("movie"),
            variant_id: VariantId::new("1080p"),
            file_size,
            quality: 1080,
        }
    }

    fn ready_transfer(file_size: u64) -> Transfer {
        let mut transfer = new_transfer();
        transfer.handle(TransferEvent::Start).unwrap();
        let offer = offer_for(&transfer, file_size);
        transfer
            .handle(TransferEvent::OfferReceived {
                offer,
                policy_accepted: true,
            })
            .unwrap();
        transfer
    }

    fn requests(file_size: u64, indices: &[u32]) -> Vec<ChunkRequest> {
        indices
            .iter()
            .map(|i| ChunkRequest::for_chunk(*i, CHUNK, file_size).unwrap())
            .collect()
    }

    fn response(transfer: &Transfer, request: &ChunkRequest) -> ChunkResponse {
        let data = Bytes::from(vec![request.chunk_index as u8; request.size as usize]);
        ChunkResponse {
            transfer_id: transfer.id(),
            chunk_index: request.chunk_index,
            offset: request.offset,
            length: request.size,
            integrity: Some(sha1_hex(&data)),
            data,
            end_of_file: false,
            error: None,
        }
    }

    /// Delivers and persists a chunk, returning the actions from both steps.
    fn deliver(transfer: &mut Transfer, request: &ChunkRequest) -> Vec<TransferAction> {
        let resp = response(transfer, request);
        let mut actions = transfer.handle(TransferEvent::ChunkReceived(resp)).unwrap();
        actions.extend(
            transfer
                .handle(TransferEvent::ChunkPersisted {
                    chunk_index: request.chunk_index,
                })
                .unwrap(),
        );
        actions
    }

    #[test]
    fn test_start_sends_offer_request() {
        let mut transfer = new_transfer();
        let actions = transfer.handle(TransferEvent::Start).unwrap();
        assert_eq!(actions, vec![TransferAction::SendOfferRequest]);
        assert_eq!(transfer.state(), TransferState::Negotiating);

        let err = transfer.handle(TransferEvent::Start).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidTransition {
                state: "negotiating",
                event: "start"
            }
        ));
    }

    #[test]
    fn test_accepted_offer_binds_peer_and_allocates_piece_map() {
        let transfer = ready_transfer(2_500_000);
        assert_eq!(transfer.state(), TransferState::Ready);
        assert_eq!(transfer.bound_peer(), Some(&PeerId::new("seeder")));
        assert_eq!(transfer.piece_map().unwrap().chunk_count(), 3);
        assert!(transfer.ready_at().is_some());
    }

    #[test]
    fn test_timeout_after_rejected_offers_is_no_acceptable_offer() {
        let mut transfer = new_transfer();
        transfer.handle(TransferEvent::Start).unwrap();
        let offer = offer_for(&transfer, 1_000);
        transfer
            .handle(TransferEvent::OfferReceived {
                offer,
                policy_accepted: false,
            })
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Negotiating);

        let actions = transfer.handle(TransferEvent::NegotiationTimedOut).unwrap();
        assert_eq!(
            actions,
            vec![TransferAction::NotifyAborted(AbortReason::NoAcceptableOffer)]
        );
        assert_eq!(transfer.abort_reason(), Some(AbortReason::NoAcceptableOffer));
    }

    #[test]
    fn test_timeout_without_offers_is_negotiation_timeout() {
        let mut transfer = new_transfer();
        transfer.handle(TransferEvent::Start).unwrap();
        transfer.handle(TransferEvent::NegotiationTimedOut).unwrap();
        assert_eq!(transfer.abort_reason(), Some(AbortReason::NegotiationTimeout));
        assert!(matches!(
            transfer.abort_error(),
            Some(TransferError::NegotiationTimeout)
        ));
    }

    #[test]
    fn test_offer_for_other_content_is_rejected() {
        let mut transfer = new_transfer();
        transfer.handle(TransferEvent::Start).unwrap();
        let mut offer = offer_for(&transfer, 1_000);
        offer.content_id = ContentId::new("other");
        transfer
            .handle(TransferEvent::OfferReceived {
                offer,
                policy_accepted: true,
            })
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Negotiating);
    }

    #[test]
    fn test_offer_with_unindexable_chunk_count_is_rejected() {
        let mut transfer = new_transfer();
        transfer.handle(TransferEvent::Start).unwrap();
        // u32::MAX + 1 chunks of CHUNK bytes
        let offer = offer_for(&transfer, (u64::from(u32::MAX) + 1) * CHUNK);
        transfer
            .handle(TransferEvent::OfferReceived {
                offer,
                policy_accepted: true,
            })
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Negotiating);
        assert!(transfer.piece_map.is_none());
    }

    #[test]
    fn test_pipeline_depth_limits_outstanding_requests() {
        let size = 3_000_000;
        let mut transfer = ready_transfer(size);
        let actions = transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[0, 1, 2])))
            .unwrap();

        let sent: Vec<u32> = actions
            .iter()
            .filter_map(|a| match a {
                TransferAction::SendChunkRequest(r) => Some(r.chunk_index),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![0, 1]);
        assert_eq!(transfer.state(), TransferState::Requesting);
        assert_eq!(transfer.queued_chunks(), vec![2]);

        // A response frees a slot for the queued chunk
        let first = requests(size, &[0])[0];
        let actions = transfer
            .handle(TransferEvent::ChunkReceived(response(&transfer, &first)))
            .unwrap();
        assert!(actions.contains(&TransferAction::SendChunkRequest(requests(size, &[2])[0])));
    }

    #[test]
    fn test_duplicate_response_does_not_double_count() {
        let size = 2_000_000;
        let mut transfer = ready_transfer(size);
        let reqs = requests(size, &[0, 1]);
        transfer
            .handle(TransferEvent::ChunksAssigned(reqs.clone()))
            .unwrap();

        deliver(&mut transfer, &reqs[0]);
        let after_first = transfer.progress();

        let again = deliver(&mut transfer, &reqs[0]);
        assert!(again.is_empty());
        assert_eq!(transfer.progress(), after_first);
        assert_eq!(after_first.bytes_received, CHUNK);
        assert_eq!(after_first.completed_chunks, 1);
    }

    #[test]
    fn test_hash_mismatch_leaves_chunk_missing_without_abort() {
        let size = 2_000_000;
        let mut transfer = ready_transfer(size);
        let reqs = requests(size, &[0, 1]);
        transfer
            .handle(TransferEvent::ChunksAssigned(reqs.clone()))
            .unwrap();

        let mut bad = response(&transfer, &reqs[1]);
        bad.integrity = Some(sha1_hex(b"something else"));
        let actions = transfer.handle(TransferEvent::ChunkReceived(bad)).unwrap();

        assert_eq!(transfer.state(), TransferState::Requesting);
        assert_eq!(
            transfer.piece_map().unwrap().state(1),
            Some(ChunkState::Missing)
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            TransferAction::ReleaseChunks { chunk_indices, .. } if chunk_indices == &vec![1]
        )));
        assert!(actions.contains(&TransferAction::ReportFailure(FailureReason::ChunkFailure)));
    }

    #[test]
    fn test_error_response_is_absorbed() {
        let size = 1_000_000;
        let mut transfer = ready_transfer(size);
        let reqs = requests(size, &[0]);
        transfer.handle(TransferEvent::ChunksAssigned(reqs.clone())).unwrap();

        let mut failed = response(&transfer, &reqs[0]);
        failed.error = Some("disk read failed".to_string());
        failed.data = Bytes::new();
        transfer.handle(TransferEvent::ChunkReceived(failed)).unwrap();

        assert_eq!(transfer.state(), TransferState::Requesting);
        assert!(transfer.in_flight_chunks().is_empty());
    }

    #[test]
    fn test_full_lifecycle_reaches_completed() {
        let size = 2_500_000;
        let mut transfer = ready_transfer(size);
        let reqs = requests(size, &[0, 1, 2]);
        transfer
            .handle(TransferEvent::ChunksAssigned(reqs.clone()))
            .unwrap();

        deliver(&mut transfer, &reqs[0]);
        deliver(&mut transfer, &reqs[1]);
        let last = deliver(&mut transfer, &reqs[2]);
        assert!(last.contains(&TransferAction::BeginVerification));
        assert_eq!(transfer.state(), TransferState::Verifying);
        assert_eq!(transfer.progress().bytes_received, size);

        let actions = transfer
            .handle(TransferEvent::VerificationFinished(VerificationOutcome::Passed))
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Completed);
        assert_eq!(
            actions,
            vec![
                TransferAction::SendCompletion,
                TransferAction::ReportSuccess,
                TransferAction::NotifyCompleted
            ]
        );
        assert!(transfer.finished_at().is_some());
    }

    #[test]
    fn test_failed_verification_aborts_and_discards() {
        let size = 1_000_000;
        let mut transfer = ready_transfer(size);
        let reqs = requests(size, &[0]);
        transfer.handle(TransferEvent::ChunksAssigned(reqs.clone())).unwrap();
        deliver(&mut transfer, &reqs[0]);

        let actions = transfer
            .handle(TransferEvent::VerificationFinished(VerificationOutcome::Failed {
                reason: "hash mismatch".to_string(),
            }))
            .unwrap();
        assert_eq!(
            transfer.state(),
            TransferState::Aborted(AbortReason::VerificationFailed)
        );
        assert!(actions.contains(&TransferAction::DiscardLocalData));
        assert!(actions.contains(&TransferAction::ReportFailure(
            FailureReason::VerificationFailed
        )));
        assert_eq!(transfer.progress().bytes_received, 0);
        assert_eq!(transfer.progress().completed_chunks, 0);
    }

    #[test]
    fn test_rebalance_cancels_reassigned_and_releases_queue() {
        let size = 4_000_000;
        let mut transfer = ready_transfer(size);
        transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[0, 1, 2, 3])))
            .unwrap();

        let actions = transfer
            .handle(TransferEvent::Rebalance { reassigned: vec![1] })
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Draining);
        assert_eq!(
            actions,
            vec![
                TransferAction::SendCancel {
                    chunk_indices: vec![1]
                },
                TransferAction::ReleaseChunks {
                    chunk_indices: vec![1, 2, 3],
                    reason: "rebalanced".to_string()
                },
            ]
        );
        assert_eq!(transfer.in_flight_chunks(), vec![0]);

        // Remaining chunks complete elsewhere; our last one drains the map
        transfer
            .handle(TransferEvent::ChunksCompletedElsewhere(vec![1, 2, 3]))
            .unwrap();
        let actions = deliver(&mut transfer, &requests(size, &[0])[0]);
        assert!(actions.contains(&TransferAction::BeginVerification));
    }

    #[test]
    fn test_new_assignment_resumes_requesting_from_draining() {
        let size = 3_000_000;
        let mut transfer = ready_transfer(size);
        transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[0])))
            .unwrap();
        transfer
            .handle(TransferEvent::Rebalance { reassigned: vec![] })
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Draining);

        let actions = transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[1])))
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Requesting);
        assert!(actions.contains(&TransferAction::SendChunkRequest(requests(size, &[1])[0])));
    }

    #[test]
    fn test_ready_transfer_filled_elsewhere_moves_to_verification() {
        let size = 2 * CHUNK;
        let mut transfer = ready_transfer(size);

        let actions = transfer
            .handle(TransferEvent::ChunksCompletedElsewhere(vec![0, 1]))
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Verifying);
        assert_eq!(actions, vec![TransferAction::BeginVerification]);
    }

    #[test]
    fn test_assignment_of_only_completed_chunks_moves_to_verification() {
        let size = 2 * CHUNK;
        let mut transfer = ready_transfer(size);
        let piece_map = transfer.piece_map.as_mut().unwrap();
        piece_map.mark_complete(0).unwrap();
        piece_map.mark_complete(1).unwrap();
        let actions = transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[0, 1])))
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Verifying);
        assert!(actions.contains(&TransferAction::BeginVerification));
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, TransferAction::SendChunkRequest(_)))
        );
    }

    #[test]
    fn test_disconnect_releases_outstanding_chunks() {
        let size = 3_000_000;
        let mut transfer = ready_transfer(size);
        transfer
            .handle(TransferEvent::ChunksAssigned(requests(size, &[0, 1, 2])))
            .unwrap();

        let actions = transfer.handle(TransferEvent::PeerDisconnected).unwrap();
        assert_eq!(
            transfer.state(),
            TransferState::Aborted(AbortReason::PeerDisconnected)
        );
        assert_eq!(
            actions,
            vec![
                TransferAction::ReleaseChunks {
                    chunk_indices: vec![0, 1, 2],
                    reason: "peer_disconnected".to_string()
                },
                TransferAction::ReportFailure(FailureReason::Disconnected),
                TransferAction::NotifyAborted(AbortReason::PeerDisconnected),
            ]
        );
        assert_eq!(transfer.piece_map().unwrap().missing_chunks(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancel_is_reachable_from_every_non_terminal_state() {
        let mut fresh = new_transfer();
        fresh.handle(TransferEvent::Cancelled).unwrap();
        assert_eq!(fresh.abort_reason(), Some(AbortReason::Cancelled));

        let mut negotiating = new_transfer();
        negotiating.handle(TransferEvent::Start).unwrap();
        let actions = negotiating.handle(TransferEvent::Cancelled).unwrap();
        assert!(actions.contains(&TransferAction::SendCancelTransfer));

        let mut verifying = ready_transfer(1_000_000);
        let reqs = requests(1_000_000, &[0]);
        verifying.handle(TransferEvent::ChunksAssigned(reqs.clone())).unwrap();
        deliver(&mut verifying, &reqs[0]);
        verifying.handle(TransferEvent::Cancelled).unwrap();
        assert_eq!(verifying.abort_reason(), Some(AbortReason::Cancelled));

        // Terminal states ignore further cancels
        assert!(verifying.handle(TransferEvent::Cancelled).unwrap().is_empty());
    }

    #[test]
    fn test_stale_timers_and_late_messages_are_ignored() {
        let mut transfer = ready_transfer(1_000_000);
        assert!(transfer.handle(TransferEvent::IdleTimedOut).unwrap().is_empty());
        assert!(transfer.handle(TransferEvent::NegotiationTimedOut).unwrap().is_empty());
        let late = offer_for(&transfer, 5);
        assert!(
            transfer
                .handle(TransferEvent::OfferReceived {
                    offer: late,
                    policy_accepted: true
                })
                .unwrap()
                .is_empty()
        );
        assert_eq!(transfer.state(), TransferState::Ready);
    }

    #[test]
    fn test_verification_result_outside_verifying_is_invalid() {
        let mut transfer = ready_transfer(1_000_000);
        let err = transfer
            .handle(TransferEvent::VerificationFinished(VerificationOutcome::Passed))
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidTransition { .. }));
        assert_eq!(transfer.state(), TransferState::Ready);
    }
}
