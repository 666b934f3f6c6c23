//! Messages exchanged with peers and the transport seam that carries them
//!
//! The engine does not care how bytes reach the wire. A [`PeerTransport`] is
//! scoped to one remote peer and carries [`OutboundMessage`]s to it and
//! [`Inbound`] messages back.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::peer::{ContentId, JobId, PeerId, TransferId, VariantId};

/// Downloader-to-uploader messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    OfferRequest(OfferRequest),
    ChunkRequest(ChunkRequestMessage),
    /// Best-effort cancel of individual outstanding chunks
    CancelChunks {
        transfer_id: TransferId,
        chunk_indices: Vec<u32>,
    },
    /// Whole-transfer cancel
    CancelTransfer { transfer_id: TransferId },
    /// Transfer verified; the uploader may release its resources
    Completion { transfer_id: TransferId },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OfferRequest(_) => "offer_request",
            Self::ChunkRequest(_) => "chunk_request",
            Self::CancelChunks { .. } => "cancel_chunks",
            Self::CancelTransfer { .. } => "cancel_transfer",
            Self::Completion { .. } => "completion",
        }
    }
}

/// Uploader-to-downloader messages.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Offer(Offer),
    ChunkResponse(ChunkResponse),
    CancelAck { transfer_id: TransferId },
}

/// An inbound message tagged with the peer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: PeerId,
    pub message: InboundMessage,
}

/// Request for offers of a piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRequest {
    pub transfer_id: TransferId,
    pub job_id: JobId,
    pub content_id: ContentId,
    pub min_quality: u32,
}

/// A peer's offer to serve a concrete variant of the requested content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub peer_id: PeerId,
    pub transfer_id: TransferId,
    pub content_id: ContentId,
    pub variant_id: VariantId,
    pub file_size: u64,
    pub quality: u32,
}

/// Request for one byte range of an offered variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequestMessage {
    pub transfer_id: TransferId,
    pub variant_id: VariantId,
    pub chunk_index: u32,
    pub offset: u64,
    pub length: u64,
    /// Time after which the requester stops waiting
    pub deadline: Duration,
}

/// Response carrying the bytes of one chunk, or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResponse {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    pub offset: u64,
    pub length: u64,
    pub data: Bytes,
    pub end_of_file: bool,
    pub error: Option<String>,
    /// Hex-encoded SHA-1 of `data`, when the uploader supplies one
    pub integrity: Option<String>,
}

impl ChunkResponse {
    /// Error response for a request that could not be served.
    pub fn failed(request: &ChunkRequestMessage, error: impl Into<String>) -> Self {
        Self {
            transfer_id: request.transfer_id,
            chunk_index: request.chunk_index,
            offset: request.offset,
            length: request.length,
            data: Bytes::new(),
            end_of_file: false,
            error: Some(error.into()),
            integrity: None,
        }
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("Peer {peer} disconnected")]
    Disconnected { peer: PeerId },

    #[error("Transport closed")]
    Closed,

    #[error("Failed to send message: {reason}")]
    Send { reason: String },
}

/// Message channel to one remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Peer this transport talks to.
    fn remote_peer(&self) -> &PeerId;

    /// Sends a message to the remote peer.
    ///
    /// # Errors
    /// - `TransportError` - Message could not be delivered
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Waits for the next inbound message.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no
    /// message.
    ///
    /// # Errors
    /// - `TransportError::Disconnected` - Remote peer went away
    /// - `TransportError::Closed` - Transport shut down locally
    async fn recv(&self) -> Result<Inbound, TransportError>;
}
