//! Uploader-side state machine
//!
//! An [`Upload`] tracks one offer made to one requesting peer, from the offer
//! through serving to teardown. It performs no I/O; the
//! [`UploadManager`](super::UploadManager) feeds it events and acts on the
//! resulting state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::UploadError;
use crate::peer::{ContentId, PeerId, TransferId, VariantId};

/// Lifecycle of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadState {
    Idle,
    Pending,
    Serving,
    Throttled,
    Teardown,
    Done,
    Rejected,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Serving => "serving",
            Self::Throttled => "throttled",
            Self::Teardown => "teardown",
            Self::Done => "done",
            Self::Rejected => "rejected",
        }
    }

    /// True once no further data will be served.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Teardown | Self::Done | Self::Rejected)
    }

    /// True while the upload holds a serving slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Serving | Self::Throttled)
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the upload state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    OfferSent,
    OfferExpired,
    FirstRequest,
    Served { bytes: u64 },
    CapacityExceeded,
    CapacityRestored,
    Cancel,
    /// No requests for longer than the offer TTL
    IdleElapsed,
    Released,
    Reject { reason: String },
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OfferSent => "offer_sent",
            Self::OfferExpired => "offer_expired",
            Self::FirstRequest => "first_request",
            Self::Served { .. } => "served",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::CapacityRestored => "capacity_restored",
            Self::Cancel => "cancel",
            Self::IdleElapsed => "idle_elapsed",
            Self::Released => "released",
            Self::Reject { .. } => "reject",
        }
    }
}

/// One offer-and-serve relationship with a requesting peer.
#[derive(Debug, Clone)]
pub struct Upload {
    transfer_id: TransferId,
    peer_id: PeerId,
    content_id: ContentId,
    variant_id: VariantId,
    file_path: PathBuf,
    file_size: u64,
    bytes_uploaded: u64,
    chunks_served: u32,
    state: UploadState,
    rejection: Option<String>,
    last_activity: Instant,
    finished_instant: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Upload {
    pub fn new(
        transfer_id: TransferId,
        peer_id: PeerId,
        content_id: ContentId,
        variant_id: VariantId,
        file_path: impl Into<PathBuf>,
        file_size: u64,
    ) -> Self {
        Self {
            transfer_id,
            peer_id,
            content_id,
            variant_id,
            file_path: file_path.into(),
            file_size,
            bytes_uploaded: 0,
            chunks_served: 0,
            state: UploadState::Idle,
            rejection: None,
            last_activity: Instant::now(),
            finished_instant: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn variant_id(&self) -> &VariantId {
        &self.variant_id
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    pub fn chunks_served(&self) -> u32 {
        self.chunks_served
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Time of the offer or the most recent served request.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// When the upload reached `Done` or `Rejected`.
    pub fn finished_instant(&self) -> Option<Instant> {
        self.finished_instant
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Applies an event.
    ///
    /// # Errors
    /// - `UploadError::InvalidTransition` - Event not valid in the current state
    pub fn apply(&mut self, event: UploadEvent) -> Result<UploadState, UploadError> {
        use UploadState::*;

        let next = match (self.state, &event) {
            (Idle, UploadEvent::OfferSent) => {
                self.last_activity = Instant::now();
                Pending
            }
            (Pending, UploadEvent::OfferExpired | UploadEvent::Cancel) => Idle,
            (Pending, UploadEvent::FirstRequest) => {
                self.started_at = Some(Utc::now());
                self.last_activity = Instant::now();
                Serving
            }
            // In-flight reads may still finish while throttled.
            (Serving | Throttled, UploadEvent::Served { bytes }) => {
                self.bytes_uploaded += bytes;
                self.chunks_served += 1;
                self.last_activity = Instant::now();
                self.state
            }
            (Serving, UploadEvent::CapacityExceeded) => Throttled,
            (Throttled, UploadEvent::CapacityRestored) => Serving,
            (Serving | Throttled, UploadEvent::Cancel | UploadEvent::IdleElapsed) => Teardown,
            (Teardown, UploadEvent::Released) => {
                self.completed_at = Some(Utc::now());
                self.finished_instant = Some(Instant::now());
                Done
            }
            (Pending | Serving | Throttled, UploadEvent::Reject { reason }) => {
                self.rejection = Some(reason.clone());
                self.completed_at = Some(Utc::now());
                self.finished_instant = Some(Instant::now());
                Rejected
            }
            (state, event) => {
                return Err(UploadError::InvalidTransition {
                    state: state.as_str(),
                    event: event.name(),
                });
            }
        };

        if next != self.state {
            tracing::debug!(
                transfer_id = %self.transfer_id,
                peer = %self.peer_id,
                "Upload {} -> {}",
                self.state,
                next
            );
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> Upload {
        Upload::new(
            TransferId::generate(),
            PeerId::new("leecher"),
            ContentId::new("movie"),
            VariantId::new("movie-1080p"),
            "/srv/movie.mkv",
            4_000,
        )
    }

    #[test]
    fn test_full_lifecycle_reaches_done() {
        let mut upload = upload();
        upload.apply(UploadEvent::OfferSent).unwrap();
        upload.apply(UploadEvent::FirstRequest).unwrap();
        upload.apply(UploadEvent::Served { bytes: 1_000 }).unwrap();
        upload.apply(UploadEvent::Served { bytes: 1_000 }).unwrap();
        upload.apply(UploadEvent::Cancel).unwrap();
        assert_eq!(upload.apply(UploadEvent::Released).unwrap(), UploadState::Done);

        assert_eq!(upload.bytes_uploaded(), 2_000);
        assert_eq!(upload.chunks_served(), 2);
        assert!(upload.started_at().is_some());
        assert!(upload.completed_at().is_some());
        assert!(upload.finished_instant().is_some());
    }

    #[test]
    fn test_expired_offer_returns_to_idle() {
        let mut upload = upload();
        upload.apply(UploadEvent::OfferSent).unwrap();
        assert_eq!(upload.apply(UploadEvent::OfferExpired).unwrap(), UploadState::Idle);
    }

    #[test]
    fn test_throttle_round_trip_keeps_counting_in_flight_reads() {
        let mut upload = upload();
        upload.apply(UploadEvent::OfferSent).unwrap();
        upload.apply(UploadEvent::FirstRequest).unwrap();
        upload.apply(UploadEvent::CapacityExceeded).unwrap();
        assert_eq!(upload.state(), UploadState::Throttled);

        upload.apply(UploadEvent::Served { bytes: 500 }).unwrap();
        assert_eq!(upload.state(), UploadState::Throttled);

        upload.apply(UploadEvent::CapacityRestored).unwrap();
        assert_eq!(upload.state(), UploadState::Serving);
        assert_eq!(upload.bytes_uploaded(), 500);
    }

    #[test]
    fn test_reject_records_reason_and_is_final() {
        let mut upload = upload();
        upload.apply(UploadEvent::OfferSent).unwrap();
        upload
            .apply(UploadEvent::Reject {
                reason: "file vanished".to_string(),
            })
            .unwrap();

        assert_eq!(upload.state(), UploadState::Rejected);
        assert_eq!(upload.rejection(), Some("file vanished"));
        assert!(upload.state().is_finished());
        assert!(upload.apply(UploadEvent::FirstRequest).is_err());
    }

    #[test]
    fn test_invalid_transition_names_state_and_event() {
        let mut upload = upload();
        let err = upload.apply(UploadEvent::Served { bytes: 1 }).unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidTransition {
                state: "idle",
                event: "served"
            }
        ));
        assert_eq!(upload.state(), UploadState::Idle);
    }

    #[test]
    fn test_serving_cannot_skip_teardown() {
        let mut upload = upload();
        upload.apply(UploadEvent::OfferSent).unwrap();
        upload.apply(UploadEvent::FirstRequest).unwrap();
        assert!(upload.apply(UploadEvent::Released).is_err());
        assert!(upload.state().is_active());
    }
}
