//! Downloader side of a swarm transfer
//!
//! [`Transfer`] is a pure state machine; [`TransferDriver`] runs one against a
//! peer transport, the scheduler, and local storage.

pub mod driver;
pub mod state;

pub use driver::{TransferCommand, TransferContext, TransferDriver, TransferHandle, TransferNotice};
pub use state::{
    AbortReason, Transfer, TransferAction, TransferBinding, TransferEvent, TransferProgress,
    TransferState,
};

use crate::transport::TransportError;

/// Errors raised by downloader transfers.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Event '{event}' is not valid in state '{state}'")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("No offer received before the negotiation deadline")]
    NegotiationTimeout,

    #[error("All offers were rejected")]
    NoAcceptableOffer,

    #[error("Chunk {chunk_index} failed: {reason}")]
    ChunkIo { chunk_index: u32, reason: String },

    #[error("Chunk {chunk_index} failed its integrity check")]
    ChunkHashMismatch { chunk_index: u32 },

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("No response from peer within the idle timeout")]
    IdleTimeout,

    #[error("Verification failed")]
    VerificationFailed,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AbortReason> for TransferError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::NegotiationTimeout => Self::NegotiationTimeout,
            AbortReason::NoAcceptableOffer => Self::NoAcceptableOffer,
            AbortReason::VerificationFailed => Self::VerificationFailed,
            AbortReason::PeerDisconnected => Self::PeerDisconnected,
            AbortReason::IdleTimeout => Self::IdleTimeout,
            AbortReason::Cancelled => Self::Cancelled,
        }
    }
}

impl TransferError {
    /// True for failures confined to one chunk; the transfer carries on.
    pub fn is_chunk_local(&self) -> bool {
        matches!(self, Self::ChunkIo { .. } | Self::ChunkHashMismatch { .. })
    }
}
