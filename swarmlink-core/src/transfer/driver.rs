//! Async executor for a single [`Transfer`]
//!
//! The driver owns one transfer and serializes everything that happens to
//! it: commands from the orchestrator, messages from the peer, and timer
//! expiry. Each input becomes a [`TransferEvent`]; the resulting actions are
//! carried out here, and any follow-up events they produce are fed back in
//! before the next input is awaited.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::TransferError;
use super::state::{AbortReason, Transfer, TransferAction, TransferEvent, TransferState};
use crate::config::TransferConfig;
use crate::metrics::{ChunkOutcome, PeerMetricsProvider};
use crate::peer::{PeerId, TransferId};
use crate::reputation::{OfferConstraints, ReputationPolicy};
use crate::scheduler::{AdaptiveScheduler, ChunkRequest, ChunkScheduling};
use crate::transport::{
    ChunkRequestMessage, Inbound, InboundMessage, OfferRequest, OutboundMessage, PeerTransport,
    TransportError,
};
use crate::verification::{ExpectedIdentity, VerificationStrategy, run_strategies};

/// Capacity of the command channel between a handle and its driver
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Stand-in deadline for select branches that are disabled
const DISARMED_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Collaborators a transfer driver works with.
#[derive(Clone)]
pub struct TransferContext {
    pub transport: Arc<dyn PeerTransport>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub metrics: Arc<dyn PeerMetricsProvider>,
    pub reputation: Arc<dyn ReputationPolicy>,
    pub verifiers: Vec<Arc<dyn VerificationStrategy>>,
}

/// Orchestrator instructions for a running transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferCommand {
    Assign(Vec<ChunkRequest>),
    Rebalance(Vec<u32>),
    CompletedElsewhere(Vec<u32>),
    Cancel,
}

/// Progress reports sent from a driver to its orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferNotice {
    Ready {
        transfer_id: TransferId,
        peer_id: PeerId,
        file_size: u64,
    },
    ChunkCompleted {
        transfer_id: TransferId,
        chunk_index: u32,
    },
    /// Chunks handed back for reassignment
    ChunksReleased {
        transfer_id: TransferId,
        chunk_indices: Vec<u32>,
        reason: String,
    },
    Completed {
        transfer_id: TransferId,
    },
    Aborted {
        transfer_id: TransferId,
        reason: AbortReason,
    },
}

/// Cloneable handle for sending commands to a running driver.
///
/// Dropping every handle cancels the transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    transfer_id: TransferId,
    commands: mpsc::Sender<TransferCommand>,
}

impl TransferHandle {
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Hands chunks to the transfer.
    ///
    /// # Errors
    /// - `TransferError::Cancelled` - Driver has already stopped
    pub async fn assign(&self, requests: Vec<ChunkRequest>) -> Result<(), TransferError> {
        self.send(TransferCommand::Assign(requests)).await
    }

    pub async fn rebalance(&self, reassigned: Vec<u32>) -> Result<(), TransferError> {
        self.send(TransferCommand::Rebalance(reassigned)).await
    }

    pub async fn completed_elsewhere(&self, indices: Vec<u32>) -> Result<(), TransferError> {
        self.send(TransferCommand::CompletedElsewhere(indices)).await
    }

    pub async fn cancel(&self) -> Result<(), TransferError> {
        self.send(TransferCommand::Cancel).await
    }

    async fn send(&self, command: TransferCommand) -> Result<(), TransferError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransferError::Cancelled)
    }
}

/// What woke the driver loop.
enum Wake {
    Command(Option<TransferCommand>),
    Inbound(Result<Inbound, TransportError>),
    Deadline,
}

/// Runs one [`Transfer`] to a terminal state.
pub struct TransferDriver {
    transfer: Transfer,
    ctx: TransferContext,
    config: TransferConfig,
    output_path: PathBuf,
    expected: ExpectedIdentity,
    commands: mpsc::Receiver<TransferCommand>,
    notices: mpsc::UnboundedSender<TransferNotice>,
    pending: VecDeque<TransferEvent>,
    request_started: HashMap<u32, Instant>,
    negotiation_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    verification_requested: bool,
}

impl TransferDriver {
    /// Creates a driver and the handle used to command it.
    ///
    /// Received chunks are written into `output_path` at their file offsets;
    /// the file is verified against `expected` once the transfer drains.
    pub fn new(
        transfer: Transfer,
        ctx: TransferContext,
        config: TransferConfig,
        output_path: impl Into<PathBuf>,
        expected: ExpectedIdentity,
        notices: mpsc::UnboundedSender<TransferNotice>,
    ) -> (Self, TransferHandle) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = TransferHandle {
            transfer_id: transfer.id(),
            commands: sender,
        };
        let driver = Self {
            transfer,
            ctx,
            config,
            output_path: output_path.into(),
            expected,
            commands: receiver,
            notices,
            pending: VecDeque::new(),
            request_started: HashMap::new(),
            negotiation_deadline: None,
            idle_deadline: None,
            verification_requested: false,
        };
        (driver, handle)
    }

    /// Runs the driver on its own task.
    pub fn spawn(self) -> JoinHandle<Transfer> {
        tokio::spawn(self.run())
    }

    /// Drives the transfer until it completes or aborts, returning it.
    pub async fn run(mut self) -> Transfer {
        tracing::debug!(transfer_id = %self.transfer.id(), "Transfer driver started");
        self.pending.push_back(TransferEvent::Start);

        loop {
            while let Some(event) = self.pending.pop_front() {
                self.dispatch(event).await;
            }
            if self.transfer.state().is_terminal() {
                break;
            }

            if self.verification_requested {
                self.verification_requested = false;
                let event = self.verify().await;
                self.pending.push_back(event);
                continue;
            }

            if let Some(event) = self.next_event().await {
                self.pending.push_back(event);
            }
        }

        tracing::debug!(
            transfer_id = %self.transfer.id(),
            state = %self.transfer.state(),
            "Transfer driver stopped"
        );
        self.transfer
    }

    async fn dispatch(&mut self, event: TransferEvent) {
        let assigned: Vec<u32> = match &event {
            TransferEvent::ChunksAssigned(requests) => {
                requests.iter().map(|r| r.chunk_index).collect()
            }
            _ => Vec::new(),
        };

        match self.transfer.handle(event) {
            Ok(actions) => {
                for action in actions {
                    self.execute(action).await;
                }
            }
            Err(e) => {
                tracing::warn!(transfer_id = %self.transfer.id(), "Rejected event: {e}");
                if !assigned.is_empty() {
                    // The transfer cannot take these; hand them straight back.
                    self.execute(TransferAction::ReleaseChunks {
                        chunk_indices: assigned,
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    fn active_deadline(&self) -> Option<(Instant, TransferEvent)> {
        match self.transfer.state() {
            TransferState::Negotiating => self
                .negotiation_deadline
                .map(|at| (at, TransferEvent::NegotiationTimedOut)),
            state if state.is_transferring() && self.transfer.progress().in_flight_chunks > 0 => {
                self.idle_deadline.map(|at| (at, TransferEvent::IdleTimedOut))
            }
            _ => None,
        }
    }

    async fn next_event(&mut self) -> Option<TransferEvent> {
        let deadline = self.active_deadline();
        let armed = deadline.is_some();
        let wake_at = deadline
            .as_ref()
            .map(|(at, _)| *at)
            .unwrap_or_else(|| Instant::now() + DISARMED_TIMER);

        let wake = tokio::select! {
            command = self.commands.recv() => Wake::Command(command),
            inbound = self.ctx.transport.recv() => Wake::Inbound(inbound),
            _ = tokio::time::sleep_until(wake_at), if armed => Wake::Deadline,
        };

        match wake {
            Wake::Command(Some(command)) => Some(Self::command_event(command)),
            // Every handle dropped
            Wake::Command(None) => Some(TransferEvent::Cancelled),
            Wake::Inbound(Ok(inbound)) => self.inbound_event(inbound).await,
            Wake::Inbound(Err(e)) => {
                tracing::warn!(transfer_id = %self.transfer.id(), "Transport failed: {e}");
                Some(TransferEvent::PeerDisconnected)
            }
            Wake::Deadline => deadline.map(|(_, event)| event),
        }
    }

    fn command_event(command: TransferCommand) -> TransferEvent {
        match command {
            TransferCommand::Assign(requests) => TransferEvent::ChunksAssigned(requests),
            TransferCommand::Rebalance(reassigned) => TransferEvent::Rebalance { reassigned },
            TransferCommand::CompletedElsewhere(indices) => {
                TransferEvent::ChunksCompletedElsewhere(indices)
            }
            TransferCommand::Cancel => TransferEvent::Cancelled,
        }
    }

    async fn inbound_event(&self, inbound: Inbound) -> Option<TransferEvent> {
        let Inbound { from, message } = inbound;
        match message {
            InboundMessage::Offer(offer) => {
                if offer.peer_id != from {
                    tracing::debug!(peer = %from, "Discarding offer made for another peer");
                    return None;
                }
                let constraints = OfferConstraints {
                    content_id: offer.content_id.clone(),
                    variant_id: offer.variant_id.clone(),
                    offered_quality: offer.quality,
                    min_quality: self.config.min_offer_quality,
                };
                let policy_accepted = self
                    .ctx
                    .reputation
                    .can_accept_offer(&from, &constraints)
                    .await;
                Some(TransferEvent::OfferReceived {
                    offer,
                    policy_accepted,
                })
            }
            InboundMessage::ChunkResponse(response) => {
                if self.transfer.bound_peer() != Some(&from) {
                    tracing::debug!(peer = %from, "Discarding chunk from unbound peer");
                    return None;
                }
                if !self
                    .ctx
                    .scheduler
                    .inner()
                    .registry()
                    .is_owned_by(response.chunk_index, &from)
                {
                    tracing::debug!(
                        transfer_id = %self.transfer.id(),
                        peer = %from,
                        chunk = response.chunk_index,
                        "Discarding response for chunk no longer owned by peer"
                    );
                    return None;
                }
                Some(TransferEvent::ChunkReceived(response))
            }
            InboundMessage::CancelAck { .. } => {
                tracing::debug!(peer = %from, "Peer acknowledged cancel");
                None
            }
        }
    }

    /// Runs verification; a cancel command interrupts it.
    async fn verify(&mut self) -> TransferEvent {
        tracing::info!(
            transfer_id = %self.transfer.id(),
            path = %self.output_path.display(),
            "Verifying assembled file"
        );

        let verification = run_strategies(&self.ctx.verifiers, &self.output_path, &self.expected);
        tokio::pin!(verification);

        loop {
            tokio::select! {
                outcome = &mut verification => {
                    return TransferEvent::VerificationFinished(outcome);
                }
                command = self.commands.recv() => match command {
                    Some(TransferCommand::Cancel) | None => return TransferEvent::Cancelled,
                    Some(other) => {
                        tracing::debug!(?other, "Ignoring command during verification");
                    }
                },
            }
        }
    }

    async fn execute(&mut self, action: TransferAction) {
        let transfer_id = self.transfer.id();

        match action {
            TransferAction::SendOfferRequest => {
                self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
                let request = OfferRequest {
                    transfer_id,
                    job_id: self.transfer.job_id().clone(),
                    content_id: self.transfer.content_id().clone(),
                    min_quality: self.config.min_offer_quality,
                };
                self.send_or_disconnect(OutboundMessage::OfferRequest(request))
                    .await;
            }
            TransferAction::NotifyReady {
                peer_id,
                variant_id,
                file_size,
            } => {
                tracing::info!(
                    transfer_id = %transfer_id,
                    peer = %peer_id,
                    variant = %variant_id,
                    file_size,
                    "Offer accepted"
                );
                self.notify(TransferNotice::Ready {
                    transfer_id,
                    peer_id,
                    file_size,
                });
            }
            TransferAction::SendChunkRequest(request) => self.send_chunk_request(request).await,
            TransferAction::ResetIdleTimer => {
                self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
            }
            TransferAction::PersistChunk {
                chunk_index,
                offset,
                data,
            } => {
                let event = match write_chunk(&self.output_path, offset, &data).await {
                    Ok(()) => TransferEvent::ChunkPersisted { chunk_index },
                    Err(e) => {
                        let error = TransferError::Io(e);
                        tracing::error!(
                            transfer_id = %transfer_id,
                            chunk = chunk_index,
                            "Failed to persist chunk: {error}"
                        );
                        TransferEvent::ChunkFailed {
                            chunk_index,
                            reason: error.to_string(),
                        }
                    }
                };
                self.pending.push_back(event);
            }
            TransferAction::RecordChunkOutcome {
                chunk_index,
                success,
                bytes,
            } => self.record_outcome(chunk_index, success, bytes).await,
            TransferAction::SendCancel { chunk_indices } => {
                for index in &chunk_indices {
                    self.request_started.remove(index);
                }
                self.send_best_effort(OutboundMessage::CancelChunks {
                    transfer_id,
                    chunk_indices,
                })
                .await;
            }
            TransferAction::SendCancelTransfer => {
                self.send_best_effort(OutboundMessage::CancelTransfer { transfer_id })
                    .await;
            }
            TransferAction::ReleaseChunks {
                chunk_indices,
                reason,
            } => {
                if let Some(peer) = self.transfer.bound_peer() {
                    let registry = self.ctx.scheduler.inner().registry();
                    for index in &chunk_indices {
                        registry.unregister_if_owner(*index, peer);
                    }
                }
                for index in &chunk_indices {
                    self.request_started.remove(index);
                }
                tracing::debug!(
                    transfer_id = %transfer_id,
                    chunks = ?chunk_indices,
                    "Released chunks: {reason}"
                );
                self.notify(TransferNotice::ChunksReleased {
                    transfer_id,
                    chunk_indices,
                    reason,
                });
            }
            TransferAction::BeginVerification => self.verification_requested = true,
            TransferAction::SendCompletion => {
                self.send_best_effort(OutboundMessage::Completion { transfer_id })
                    .await;
            }
            TransferAction::DiscardLocalData => self.discard_local_data().await,
            TransferAction::ReportFailure(reason) => {
                if let Some(peer) = self.transfer.bound_peer() {
                    self.ctx.reputation.record_failure(peer, reason).await;
                }
            }
            TransferAction::ReportSuccess => {
                if let Some(peer) = self.transfer.bound_peer() {
                    self.ctx.reputation.record_success(peer).await;
                }
            }
            TransferAction::NotifyCompleted => {
                tracing::info!(
                    transfer_id = %transfer_id,
                    bytes = self.transfer.progress().bytes_received,
                    "Transfer completed"
                );
                self.notify(TransferNotice::Completed { transfer_id });
            }
            TransferAction::NotifyAborted(reason) => {
                tracing::warn!(transfer_id = %transfer_id, reason = %reason, "Transfer aborted");
                self.notify(TransferNotice::Aborted {
                    transfer_id,
                    reason,
                });
            }
        }
    }

    async fn send_chunk_request(&mut self, request: ChunkRequest) {
        let Some(binding) = self.transfer.binding().cloned() else {
            return;
        };
        let peer = &binding.peer_id;

        // Re-issued chunks bypass the scheduler and must be claimed here.
        if self.ctx.scheduler.assigned_peer(request.chunk_index).is_none() {
            self.ctx
                .scheduler
                .register_assignment(request.chunk_index, peer.clone());
        }
        self.ctx.metrics.record_chunk_requested(peer);
        self.request_started
            .insert(request.chunk_index, Instant::now());

        tracing::debug!(
            transfer_id = %self.transfer.id(),
            peer = %peer,
            chunk = request.chunk_index,
            "Requesting chunk"
        );
        let message = ChunkRequestMessage {
            transfer_id: self.transfer.id(),
            variant_id: binding.variant_id.clone(),
            chunk_index: request.chunk_index,
            offset: request.offset,
            length: request.size,
            deadline: self.config.idle_timeout,
        };
        self.send_or_disconnect(OutboundMessage::ChunkRequest(message))
            .await;
    }

    async fn record_outcome(&mut self, chunk_index: u32, success: bool, bytes: u64) {
        let Some(peer) = self.transfer.bound_peer().cloned() else {
            return;
        };
        let duration_ms = self
            .request_started
            .remove(&chunk_index)
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);

        // Scheduler first, so its snapshot reflects the metrics the decision was made on.
        self.ctx
            .scheduler
            .record_chunk_completion(chunk_index, &peer, success, duration_ms, bytes)
            .await;

        let outcome = if success {
            // Request-to-response latency stands in for RTT.
            self.ctx.metrics.record_rtt_sample(&peer, duration_ms as f64);
            ChunkOutcome::succeeded(duration_ms, bytes)
        } else {
            ChunkOutcome::failed(duration_ms)
        };
        self.ctx.metrics.record_chunk_completion(&peer, outcome);

        if success {
            self.notify(TransferNotice::ChunkCompleted {
                transfer_id: self.transfer.id(),
                chunk_index,
            });
        }
    }

    async fn discard_local_data(&self) {
        match tokio::fs::remove_file(&self.output_path).await {
            Ok(()) => tracing::info!(
                path = %self.output_path.display(),
                "Discarded unverified local data"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                path = %self.output_path.display(),
                "Failed to discard local data: {e}"
            ),
        }
    }

    /// Sends a message; failure is treated as losing the peer.
    async fn send_or_disconnect(&mut self, message: OutboundMessage) {
        let kind = message.kind();
        let result =
            tokio::time::timeout(self.config.idle_timeout, self.ctx.transport.send(message)).await;
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => TransferError::Transport(e),
            Err(_) => TransferError::Transport(TransportError::Send {
                reason: format!("{kind} timed out"),
            }),
        };
        tracing::warn!(transfer_id = %self.transfer.id(), "Failed to send {kind}: {error}");
        self.pending.push_back(TransferEvent::PeerDisconnected);
    }

    /// Sends a message the peer is not required to receive, bounded by the cancel timeout.
    async fn send_best_effort(&self, message: OutboundMessage) {
        let kind = message.kind();
        match tokio::time::timeout(self.config.cancel_timeout, self.ctx.transport.send(message))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Best-effort {kind} not delivered: {e}"),
            Err(_) => tracing::debug!("Best-effort {kind} timed out"),
        }
    }

    fn notify(&self, notice: TransferNotice) {
        // Orchestrator may have stopped listening; the transfer still finishes.
        let _ = self.notices.send(notice);
    }
}

/// Writes `data` at `offset`, creating the file if needed.
async fn write_chunk(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}
