//! Uploader side of a swarm transfer
//!
//! [`Upload`] is the per-request state machine, [`UploadThrottle`] the
//! bandwidth and slot limits, and [`UploadManager`] the service that answers
//! offer and chunk requests from downloading peers.

pub mod manager;
pub mod state;
pub mod throttle;

pub use manager::{
    ContentCatalog, InMemoryCatalog, ServableContent, SweepReport, UploadManager, UploadStats,
};
pub use state::{Upload, UploadEvent, UploadState};
pub use throttle::{TokenBucket, TokenBucketError, UploadThrottle};

use crate::peer::{ContentId, PeerId, TransferId};

/// Identifies one upload session: the requesting peer and its transfer.
pub type SessionKey = (PeerId, TransferId);

/// Errors raised while serving peers.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Content {content_id} is not available here")]
    UnknownContent { content_id: ContentId },

    #[error("No offer outstanding for transfer {transfer_id}")]
    NoOffer { transfer_id: TransferId },

    #[error("Requested variant does not match the offer")]
    VariantMismatch,

    #[error("Range {offset}+{length} lies outside a {file_size} byte file")]
    RangeOutOfBounds {
        offset: u64,
        length: u64,
        file_size: u64,
    },

    #[error("Rate limited: {0}")]
    RateLimited(#[from] TokenBucketError),

    #[error("All {max_slots} serving slots are in use")]
    SlotsExhausted { max_slots: usize },

    #[error("Policy violation: {reason}")]
    PolicyViolation { reason: String },

    #[error("File unavailable: {reason}")]
    FileUnavailable { reason: String },

    #[error("Transfer already finished")]
    TransferFinished,

    #[error("Event '{event}' is not valid in upload state '{state}'")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// True when the downloader may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::SlotsExhausted { .. })
    }
}
