//! Swarmlink Core - Multi-source swarm transfer engine
//!
//! This crate splits one file into fixed-size chunks, assigns each chunk to
//! the peer with the lowest transport cost, learns its scoring weights from
//! observed outcomes, and runs the downloader and uploader state machines
//! that move the bytes.

pub mod config;
pub mod metrics;
pub mod peer;
pub mod piece_map;
pub mod reputation;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod tracing_setup;
pub mod transfer;
pub mod transport;
pub mod upload;
pub mod verification;

// Re-export main types for convenient access
pub use config::{ConfigError, SwarmConfig};
pub use metrics::{PeerMetricsCollector, PeerMetricsProvider, PeerPerformanceMetrics};
pub use peer::{ContentId, JobId, PeerId, TransferId, VariantId};
pub use piece_map::{ChunkState, PieceMap, PieceMapError};
pub use reputation::{PeerReputationTracker, ReputationPolicy};
pub use scheduler::{
    AdaptiveScheduler, ChunkAssignment, ChunkRequest, ChunkScheduler, ChunkScheduling,
    DegradationReason, SchedulerError, SchedulerWeights,
};
pub use transfer::{Transfer, TransferDriver, TransferError, TransferState};
pub use transport::{PeerTransport, TransportError};
pub use upload::{UploadError, UploadManager, UploadState};
pub use verification::{VerificationError, VerificationStrategy};

/// Errors that can bubble up from any Swarmlink subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Piece map error: {0}")]
    PieceMap(#[from] PieceMapError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for SwarmError {
    fn from(error: ConfigError) -> Self {
        SwarmError::Configuration {
            reason: error.reason,
        }
    }
}

impl SwarmError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SwarmError::Scheduler(e) => match e {
                SchedulerError::NoCandidates { .. } => {
                    "No peers available for download".to_string()
                }
                SchedulerError::AllCandidatesIneligible { .. } => {
                    "All available peers are untrusted".to_string()
                }
            },
            SwarmError::Transfer(e) => match e {
                TransferError::NegotiationTimeout | TransferError::NoAcceptableOffer => {
                    "Peer did not offer the requested content".to_string()
                }
                TransferError::VerificationFailed => {
                    "Downloaded file failed verification".to_string()
                }
                TransferError::Cancelled => "Download cancelled".to_string(),
                _ => "Download error occurred".to_string(),
            },
            SwarmError::Upload(_) => "Upload error occurred".to_string(),
            SwarmError::Verification(_) => "Verification error occurred".to_string(),
            SwarmError::Transport(_) => "Connection to peer lost".to_string(),
            SwarmError::PieceMap(_) => "Invalid file layout".to_string(),
            SwarmError::Configuration { reason } => format!("Configuration error: {reason}"),
            SwarmError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// True when the job can carry on, typically with other peers.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SwarmError::Scheduler(_) | SwarmError::Transport(_) => true,
            SwarmError::Transfer(e) => !matches!(e, TransferError::Cancelled),
            SwarmError::Upload(e) => e.is_retryable(),
            SwarmError::Verification(_)
            | SwarmError::PieceMap(_)
            | SwarmError::Configuration { .. }
            | SwarmError::Io(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
