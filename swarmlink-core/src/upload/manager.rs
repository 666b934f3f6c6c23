//! Serves offered content to downloading peers.
//!
//! The manager owns every [`Upload`] this node is part of, keyed by the
//! requesting peer and its transfer id. Locks are never held across file
//! I/O; each session's file handle sits behind its own async mutex.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;

use super::state::{Upload, UploadEvent, UploadState};
use super::throttle::UploadThrottle;
use super::{SessionKey, UploadError};
use crate::config::UploadConfig;
use crate::peer::{ContentId, PeerId, TransferId, VariantId};
use crate::transport::{
    ChunkRequestMessage, ChunkResponse, InboundMessage, Offer, OfferRequest, OutboundMessage,
};
use crate::verification::{sha1_file_hex, sha1_hex};

/// A file this node can serve.
#[derive(Debug, Clone, PartialEq)]
pub struct ServableContent {
    pub content_id: ContentId,
    pub variant_id: VariantId,
    pub path: PathBuf,
    pub file_size: u64,
    pub quality: u32,
    /// Hex SHA-1 the on-disk file must match before serving starts
    pub expected_sha1: Option<String>,
}

impl ServableContent {
    /// Describes an existing file, taking its size from disk.
    ///
    /// # Errors
    /// - `std::io::Error` - File metadata cannot be read
    pub async fn from_file(
        content_id: ContentId,
        variant_id: VariantId,
        path: impl Into<PathBuf>,
        quality: u32,
    ) -> Result<Self, std::io::Error> {
        let path = path.into();
        let file_size = tokio::fs::metadata(&path).await?.len();
        Ok(Self {
            content_id,
            variant_id,
            path,
            file_size,
            quality,
            expected_sha1: None,
        })
    }

    pub fn with_expected_sha1(mut self, hash: impl Into<String>) -> Self {
        self.expected_sha1 = Some(hash.into());
        self
    }
}

/// Lookup of servable content by id.
pub trait ContentCatalog: Send + Sync {
    fn lookup(&self, content_id: &ContentId) -> Option<ServableContent>;
}

/// Catalog held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<ContentId, ServableContent>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, content: ServableContent) {
        self.entries
            .write()
            .insert(content.content_id.clone(), content);
    }

    pub fn remove(&self, content_id: &ContentId) -> Option<ServableContent> {
        self.entries.write().remove(content_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentCatalog for InMemoryCatalog {
    fn lookup(&self, content_id: &ContentId) -> Option<ServableContent> {
        self.entries.read().get(content_id).cloned()
    }
}

/// Result of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Offers dropped after their TTL with no chunk request
    pub expired_offers: usize,
    /// Serving sessions closed for inactivity
    pub torn_down: usize,
    /// Finished records removed after retention
    pub discarded: usize,
}

/// Snapshot of uploader activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub pending: usize,
    pub serving: usize,
    pub throttled: usize,
    pub finished: usize,
    pub bytes_served: u64,
}

struct Session {
    upload: Upload,
    quality: u32,
    expected_sha1: Option<String>,
    file: Option<Arc<tokio::sync::Mutex<File>>>,
}

/// Answers offer and chunk requests for the content in a catalog.
pub struct UploadManager {
    local_peer: PeerId,
    config: UploadConfig,
    catalog: Arc<dyn ContentCatalog>,
    sessions: RwLock<HashMap<SessionKey, Session>>,
    throttle: Mutex<UploadThrottle>,
    /// Longest range a single request may ask for
    request_limit: u64,
    bytes_served: AtomicU64,
}

impl UploadManager {
    pub fn new(local_peer: PeerId, config: UploadConfig, catalog: Arc<dyn ContentCatalog>) -> Self {
        let throttle = UploadThrottle::new(&config);
        let request_limit = config.max_request_bytes.min(throttle.max_payable());
        Self {
            local_peer,
            config,
            catalog,
            sessions: RwLock::new(HashMap::new()),
            throttle: Mutex::new(throttle),
            request_limit,
            bytes_served: AtomicU64::new(0),
        }
    }

    /// Longest byte range a single chunk request may ask for.
    pub fn request_limit(&self) -> u64 {
        self.request_limit
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Copy of the upload for a peer's transfer, if one is tracked.
    pub fn upload(&self, peer: &PeerId, transfer_id: TransferId) -> Option<Upload> {
        self.sessions
            .read()
            .get(&(peer.clone(), transfer_id))
            .map(|session| session.upload.clone())
    }

    /// Offers content to a requesting peer.
    ///
    /// A repeated request for a live offer returns the same offer.
    ///
    /// # Errors
    /// - `UploadError::UnknownContent` - Content not in the catalog or below the requested quality
    /// - `UploadError::SlotsExhausted` - Every serving slot is taken
    /// - `UploadError::TransferFinished` - This transfer was already served to completion
    pub fn handle_offer_request(
        &self,
        from: &PeerId,
        request: &OfferRequest,
    ) -> Result<Offer, UploadError> {
        let content = self
            .catalog
            .lookup(&request.content_id)
            .filter(|content| content.quality >= request.min_quality)
            .ok_or_else(|| UploadError::UnknownContent {
                content_id: request.content_id.clone(),
            })?;

        let key = (from.clone(), request.transfer_id);
        let mut sessions = self.sessions.write();

        if let Some(existing) = sessions.get(&key) {
            if existing.upload.state().is_finished() {
                return Err(UploadError::TransferFinished);
            }
            if existing.upload.state() != UploadState::Idle {
                return Ok(self.offer_for(&existing.upload, existing.quality));
            }
        }

        if !self.throttle.lock().has_free_slot() {
            tracing::warn!(peer = %from, "Declining offer request: serving slots exhausted");
            return Err(UploadError::SlotsExhausted {
                max_slots: self.config.max_serving_slots,
            });
        }

        let mut upload = Upload::new(
            request.transfer_id,
            from.clone(),
            content.content_id.clone(),
            content.variant_id.clone(),
            content.path.clone(),
            content.file_size,
        );
        upload.apply(UploadEvent::OfferSent)?;
        let offer = self.offer_for(&upload, content.quality);

        tracing::info!(
            transfer_id = %request.transfer_id,
            peer = %from,
            variant = %content.variant_id,
            "Offered {} bytes",
            content.file_size
        );
        sessions.insert(
            key,
            Session {
                upload,
                quality: content.quality,
                expected_sha1: content.expected_sha1,
                file: None,
            },
        );
        Ok(offer)
    }

    /// Serves one byte range of an offered variant.
    ///
    /// The first request for an offer opens (and, when an expected hash is
    /// known, verifies) the file.
    ///
    /// # Errors
    /// - `UploadError::NoOffer` - No live offer for this transfer
    /// - `UploadError::TransferFinished` - Upload already torn down or rejected
    /// - `UploadError::VariantMismatch` / `UploadError::RangeOutOfBounds` - Request does not fit the offer
    /// - `UploadError::PolicyViolation` - Request longer than [`Self::request_limit`]; upload rejected
    /// - `UploadError::RateLimited` - Bandwidth exhausted; retry later
    /// - `UploadError::SlotsExhausted` - No slot left to start serving
    /// - `UploadError::FileUnavailable` - File missing, changed, or unreadable; upload rejected
    pub async fn handle_chunk_request(
        &self,
        from: &PeerId,
        request: &ChunkRequestMessage,
    ) -> Result<ChunkResponse, UploadError> {
        let key = (from.clone(), request.transfer_id);

        let (needs_open, file_size) = {
            let sessions = self.sessions.read();
            let session = sessions.get(&key).ok_or(UploadError::NoOffer {
                transfer_id: request.transfer_id,
            })?;
            validate_request(&session.upload, request)?;
            (
                session.upload.state() == UploadState::Pending,
                session.upload.file_size(),
            )
        };

        if request.length > self.request_limit {
            let reason = format!(
                "request for {} bytes exceeds the {} byte limit",
                request.length, self.request_limit
            );
            tracing::warn!(transfer_id = %request.transfer_id, peer = %from, "{reason}");
            self.reject(&key, reason.clone());
            return Err(UploadError::PolicyViolation { reason });
        }

        if needs_open {
            self.open_session(&key).await?;
        }
        self.admit(&key, request.length)?;

        let file = self
            .sessions
            .read()
            .get(&key)
            .and_then(|session| session.file.clone())
            .ok_or(UploadError::TransferFinished)?;

        let data = match read_range(&file, request.offset, request.length).await {
            Ok(data) => data,
            Err(e) => {
                let reason = format!("read failed at offset {}: {e}", request.offset);
                tracing::error!(transfer_id = %request.transfer_id, peer = %from, "{reason}");
                self.reject(&key, reason.clone());
                return Err(UploadError::FileUnavailable { reason });
            }
        };

        if let Some(session) = self.sessions.write().get_mut(&key)
            && let Err(e) = session.upload.apply(UploadEvent::Served {
                bytes: request.length,
            })
        {
            tracing::debug!("Served chunk after session closed: {e}");
        }
        self.bytes_served
            .fetch_add(request.length, Ordering::Relaxed);

        tracing::debug!(
            transfer_id = %request.transfer_id,
            peer = %from,
            chunk = request.chunk_index,
            "Served {} bytes",
            request.length
        );

        let integrity = sha1_hex(&data);
        Ok(ChunkResponse {
            transfer_id: request.transfer_id,
            chunk_index: request.chunk_index,
            offset: request.offset,
            length: request.length,
            data: Bytes::from(data),
            end_of_file: request.offset + request.length == file_size,
            error: None,
            integrity: Some(integrity),
        })
    }

    /// Handles a whole-transfer cancel from the downloader. Repeats are harmless.
    ///
    /// # Errors
    /// - `UploadError::NoOffer` - Transfer unknown
    pub fn handle_cancel(&self, from: &PeerId, transfer_id: TransferId) -> Result<(), UploadError> {
        self.close(&(from.clone(), transfer_id), "cancelled")
    }

    /// Handles the downloader's completion signal. Repeats are harmless.
    ///
    /// # Errors
    /// - `UploadError::NoOffer` - Transfer unknown
    pub fn handle_completion(
        &self,
        from: &PeerId,
        transfer_id: TransferId,
    ) -> Result<(), UploadError> {
        self.close(&(from.clone(), transfer_id), "completed")
    }

    /// Routes one downloader message, returning the reply if there is one.
    ///
    /// Offer requests that cannot be satisfied get no reply; failed chunk
    /// requests get an error response.
    pub async fn handle_message(
        &self,
        from: &PeerId,
        message: OutboundMessage,
    ) -> Option<InboundMessage> {
        match message {
            OutboundMessage::OfferRequest(request) => {
                match self.handle_offer_request(from, &request) {
                    Ok(offer) => Some(InboundMessage::Offer(offer)),
                    Err(e) => {
                        tracing::debug!(peer = %from, "No offer: {e}");
                        None
                    }
                }
            }
            OutboundMessage::ChunkRequest(request) => {
                let response = match self.handle_chunk_request(from, &request).await {
                    Ok(response) => response,
                    Err(e) => ChunkResponse::failed(&request, e.to_string()),
                };
                Some(InboundMessage::ChunkResponse(response))
            }
            // Requests are answered as they arrive, so there is nothing to stop.
            OutboundMessage::CancelChunks { transfer_id, .. } => {
                Some(InboundMessage::CancelAck { transfer_id })
            }
            OutboundMessage::CancelTransfer { transfer_id } => {
                if let Err(e) = self.handle_cancel(from, transfer_id) {
                    tracing::debug!(peer = %from, "Cancel for unknown transfer: {e}");
                }
                Some(InboundMessage::CancelAck { transfer_id })
            }
            OutboundMessage::Completion { transfer_id } => {
                if let Err(e) = self.handle_completion(from, transfer_id) {
                    tracing::debug!(peer = %from, "Completion for unknown transfer: {e}");
                }
                None
            }
        }
    }

    /// Expires stale offers, closes idle sessions, and forgets old records.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut released = Vec::new();

        self.sessions.write().retain(|key, session| {
            let upload = &mut session.upload;
            let idle_for = now.duration_since(upload.last_activity());

            match upload.state() {
                UploadState::Pending if idle_for >= self.config.offer_ttl => {
                    log_transition(upload.apply(UploadEvent::OfferExpired));
                    report.expired_offers += 1;
                    false
                }
                UploadState::Serving | UploadState::Throttled
                    if idle_for >= self.config.offer_ttl =>
                {
                    log_transition(upload.apply(UploadEvent::IdleElapsed));
                    session.file = None;
                    log_transition(upload.apply(UploadEvent::Released));
                    released.push(key.clone());
                    report.torn_down += 1;
                    true
                }
                UploadState::Done | UploadState::Rejected => {
                    let expired = upload
                        .finished_instant()
                        .is_some_and(|at| now.duration_since(at) >= self.config.retention);
                    if expired {
                        report.discarded += 1;
                    }
                    !expired
                }
                UploadState::Idle => false,
                _ => true,
            }
        });

        let mut throttle = self.throttle.lock();
        for key in &released {
            throttle.release(key);
        }
        drop(throttle);

        if report != SweepReport::default() {
            tracing::info!(?report, "Upload sweep");
        }
        report
    }

    pub fn stats(&self) -> UploadStats {
        let sessions = self.sessions.read();
        let mut stats = UploadStats {
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            ..UploadStats::default()
        };
        for session in sessions.values() {
            match session.upload.state() {
                UploadState::Pending => stats.pending += 1,
                UploadState::Serving => stats.serving += 1,
                UploadState::Throttled => stats.throttled += 1,
                UploadState::Done | UploadState::Rejected => stats.finished += 1,
                UploadState::Idle | UploadState::Teardown => {}
            }
        }
        stats
    }

    fn offer_for(&self, upload: &Upload, quality: u32) -> Offer {
        Offer {
            peer_id: self.local_peer.clone(),
            transfer_id: upload.transfer_id(),
            content_id: upload.content_id().clone(),
            variant_id: upload.variant_id().clone(),
            file_size: upload.file_size(),
            quality,
        }
    }

    async fn open_session(&self, key: &SessionKey) -> Result<(), UploadError> {
        let (path, file_size, expected) = {
            let sessions = self.sessions.read();
            let session = sessions.get(key).ok_or(UploadError::TransferFinished)?;
            (
                session.upload.file_path().clone(),
                session.upload.file_size(),
                session.expected_sha1.clone(),
            )
        };

        if !self.throttle.lock().try_open(key) {
            return Err(UploadError::SlotsExhausted {
                max_slots: self.config.max_serving_slots,
            });
        }

        let file = match open_verified(&path, file_size, expected.as_deref()).await {
            Ok(file) => file,
            Err(reason) => {
                tracing::warn!(
                    peer = %key.0,
                    path = %path.display(),
                    "Refusing to serve: {reason}"
                );
                self.reject(key, reason.clone());
                return Err(UploadError::FileUnavailable { reason });
            }
        };

        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(key) else {
            drop(sessions);
            self.throttle.lock().release(key);
            return Err(UploadError::TransferFinished);
        };
        // A concurrent first request may have opened the session already.
        if session.upload.state() == UploadState::Pending {
            session.upload.apply(UploadEvent::FirstRequest)?;
            session.file = Some(Arc::new(tokio::sync::Mutex::new(file)));
            tracing::info!(
                transfer_id = %key.1,
                peer = %key.0,
                path = %path.display(),
                "Serving started"
            );
        }
        Ok(())
    }

    /// Charges the throttle for a request and moves the upload between
    /// serving and throttled accordingly.
    fn admit(&self, key: &SessionKey, bytes: u64) -> Result<(), UploadError> {
        let verdict = self.throttle.lock().try_acquire(key, bytes);

        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(key)
            .ok_or(UploadError::TransferFinished)?;
        let state = session.upload.state();

        match verdict {
            Ok(()) => {
                if state == UploadState::Throttled {
                    session.upload.apply(UploadEvent::CapacityRestored)?;
                    tracing::info!(transfer_id = %key.1, peer = %key.0, "Upload resumed");
                }
                Ok(())
            }
            Err(e) => {
                if state == UploadState::Serving {
                    session.upload.apply(UploadEvent::CapacityExceeded)?;
                    tracing::warn!(transfer_id = %key.1, peer = %key.0, "Upload throttled: {e}");
                }
                Err(UploadError::RateLimited(e))
            }
        }
    }

    fn reject(&self, key: &SessionKey, reason: String) {
        if let Some(session) = self.sessions.write().get_mut(key) {
            session.file = None;
            log_transition(session.upload.apply(UploadEvent::Reject { reason }));
        }
        self.throttle.lock().release(key);
    }

    fn close(&self, key: &SessionKey, why: &str) -> Result<(), UploadError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(key).ok_or(UploadError::NoOffer {
            transfer_id: key.1,
        })?;

        let release_slot = match session.upload.state() {
            UploadState::Pending => {
                session.upload.apply(UploadEvent::Cancel)?;
                sessions.remove(key);
                false
            }
            UploadState::Serving | UploadState::Throttled => {
                session.upload.apply(UploadEvent::Cancel)?;
                session.file = None;
                session.upload.apply(UploadEvent::Released)?;
                tracing::info!(
                    transfer_id = %key.1,
                    peer = %key.0,
                    bytes = session.upload.bytes_uploaded(),
                    "Upload {why}"
                );
                true
            }
            UploadState::Teardown => {
                session.file = None;
                session.upload.apply(UploadEvent::Released)?;
                true
            }
            UploadState::Idle | UploadState::Done | UploadState::Rejected => false,
        };
        drop(sessions);

        if release_slot {
            self.throttle.lock().release(key);
        }
        Ok(())
    }
}

fn validate_request(upload: &Upload, request: &ChunkRequestMessage) -> Result<(), UploadError> {
    match upload.state() {
        UploadState::Idle => {
            return Err(UploadError::NoOffer {
                transfer_id: request.transfer_id,
            });
        }
        state if state.is_finished() => return Err(UploadError::TransferFinished),
        _ => {}
    }

    if request.variant_id != *upload.variant_id() {
        return Err(UploadError::VariantMismatch);
    }

    let file_size = upload.file_size();
    let in_bounds = request.length > 0
        && request
            .offset
            .checked_add(request.length)
            .is_some_and(|end| end <= file_size);
    if !in_bounds {
        return Err(UploadError::RangeOutOfBounds {
            offset: request.offset,
            length: request.length,
            file_size,
        });
    }
    Ok(())
}

async fn open_verified(
    path: &Path,
    file_size: u64,
    expected: Option<&str>,
) -> Result<File, String> {
    let file = File::open(path)
        .await
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let actual_size = file
        .metadata()
        .await
        .map_err(|e| format!("cannot stat {}: {e}", path.display()))?
        .len();
    if actual_size != file_size {
        return Err(format!(
            "file size changed from {file_size} to {actual_size} bytes"
        ));
    }

    if let Some(expected) = expected {
        let actual = sha1_file_hex(path).await.map_err(|e| e.to_string())?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "on-disk integrity check failed: expected {expected}, found {actual}"
            ));
        }
    }
    Ok(file)
}

async fn read_range(
    file: &tokio::sync::Mutex<File>,
    offset: u64,
    length: u64,
) -> std::io::Result<Vec<u8>> {
    let mut file = file.lock().await;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; length as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

fn log_transition(result: Result<UploadState, UploadError>) {
    if let Err(e) = result {
        tracing::debug!("Upload transition skipped: {e}");
    }
}
