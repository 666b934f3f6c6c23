//! Test fixtures for scheduler and transfer testing.
//!
//! Provides fixed metrics providers, in-memory peer transports, and a serving
//! peer backed by a temporary file so transfers can run end to end without a
//! network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::UploadConfig;
use crate::metrics::{ChunkOutcome, PeerMetricsProvider, PeerPerformanceMetrics};
use crate::peer::{ContentId, PeerId, VariantId};
use crate::transport::{
    ChunkRequestMessage, Inbound, InboundMessage, Offer, OutboundMessage, PeerTransport,
    TransportError,
};
use crate::upload::{InMemoryCatalog, ServableContent, UploadManager};

/// Requests assumed by [`StaticMetrics::with_peer`] when deriving counters
const HISTORY_REQUESTS: u32 = 20;

/// Metrics provider returning fixed snapshots.
///
/// Outcome reports are ignored so every scheduling decision sees the same
/// numbers.
#[derive(Debug, Default, Clone)]
pub struct StaticMetrics {
    peers: HashMap<PeerId, PeerPerformanceMetrics>,
}

impl StaticMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer with history; failure counts follow from `reputation`.
    pub fn with_peer(mut self, peer: &str, throughput: f64, rtt_ms: f64, reputation: f64) -> Self {
        let failure_share = 1.0 - reputation.clamp(0.0, 1.0);
        let failed = (failure_share * HISTORY_REQUESTS as f64).round() as u32;
        let metrics = PeerPerformanceMetrics {
            peer_id: PeerId::new(peer),
            rtt_avg_ms: rtt_ms,
            throughput_avg_bytes_per_sec: throughput,
            chunks_requested: HISTORY_REQUESTS,
            chunks_completed: HISTORY_REQUESTS - failed,
            chunks_failed: failed,
            chunks_timed_out: 0,
            reputation_score: reputation,
        };
        self.peers.insert(PeerId::new(peer), metrics);
        self
    }

    /// Adds a fully specified snapshot.
    pub fn with_metrics(mut self, metrics: PeerPerformanceMetrics) -> Self {
        self.peers.insert(metrics.peer_id.clone(), metrics);
        self
    }
}

impl PeerMetricsProvider for StaticMetrics {
    fn metrics(&self, peer: &PeerId) -> Option<PeerPerformanceMetrics> {
        self.peers.get(peer).cloned()
    }

    fn record_chunk_requested(&self, _peer: &PeerId) {}

    fn record_chunk_completion(&self, _peer: &PeerId, _outcome: ChunkOutcome) {}

    fn record_rtt_sample(&self, _peer: &PeerId, _rtt_ms: f64) {}

    fn record_throughput_sample(&self, _peer: &PeerId, _bytes_per_sec: f64) {}
}

/// Peer ids from string literals.
pub fn peer_ids(names: &[&str]) -> Vec<PeerId> {
    names.iter().map(|name| PeerId::new(*name)).collect()
}

/// Identical, healthy metrics for every peer.
pub fn uniform_metrics(peers: &[PeerId]) -> StaticMetrics {
    peers.iter().fold(StaticMetrics::new(), |metrics, peer| {
        metrics.with_peer(peer.as_str(), 1_000_000.0, 50.0, 0.9)
    })
}

/// Deterministic, non-repeating-looking test payload.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

type Responder = Box<dyn Fn(&OutboundMessage) -> Vec<InboundMessage> + Send + Sync>;

/// In-memory [`PeerTransport`] for tests.
///
/// Records everything sent. Replies come from an [`UploadManager`] when built
/// with [`serving`](Self::serving), from a scripted responder, or from
/// [`push`](Self::push).
pub struct MockPeerTransport {
    remote: PeerId,
    inbound_tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Inbound, TransportError>>>,
    sent: Mutex<Vec<OutboundMessage>>,
    disconnected: AtomicBool,
    responder: Option<Responder>,
    uploader: Option<(PeerId, Arc<UploadManager>)>,
}

impl MockPeerTransport {
    /// Transport to a peer that never answers on its own.
    pub fn new(remote: impl Into<PeerId>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            remote: remote.into(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            responder: None,
            uploader: None,
        }
    }

    /// Transport whose remote side is `manager`, seeing us as `local`.
    pub fn serving(remote: PeerId, local: PeerId, manager: Arc<UploadManager>) -> Self {
        let mut transport = Self::new(remote);
        transport.uploader = Some((local, manager));
        transport
    }

    /// Replies to each sent message with whatever `responder` returns.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&OutboundMessage) -> Vec<InboundMessage> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Answers offer requests for `content` and ignores everything else.
    pub fn offering(self, content: &str, file_size: u64) -> Self {
        let remote = self.remote.clone();
        let content = ContentId::new(content);
        self.with_responder(move |message| match message {
            OutboundMessage::OfferRequest(request) if request.content_id == content => {
                vec![InboundMessage::Offer(Offer {
                    peer_id: remote.clone(),
                    transfer_id: request.transfer_id,
                    content_id: content.clone(),
                    variant_id: VariantId::new(format!("{content}-source")),
                    file_size,
                    quality: 1080,
                })]
            }
            _ => Vec::new(),
        })
    }

    /// Injects a message as if sent by the remote peer.
    pub fn push(&self, message: InboundMessage) {
        self.push_from(self.remote.clone(), message);
    }

    /// Injects a message claiming to come from `from`.
    pub fn push_from(&self, from: PeerId, message: InboundMessage) {
        let _ = self.inbound_tx.send(Ok(Inbound { from, message }));
    }

    /// Drops the connection: pending and future calls fail.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        let _ = self.inbound_tx.send(Err(TransportError::Disconnected {
            peer: self.remote.clone(),
        }));
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(OutboundMessage::kind).collect()
    }

    pub fn chunk_requests(&self) -> Vec<ChunkRequestMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                OutboundMessage::ChunkRequest(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Disconnected {
                peer: self.remote.clone(),
            });
        }
        self.sent.lock().push(message.clone());

        if let Some((local, manager)) = &self.uploader {
            if let Some(reply) = manager.handle_message(local, message).await {
                self.push(reply);
            }
        } else if let Some(responder) = &self.responder {
            for reply in responder(&message) {
                self.push(reply);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Inbound, TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Disconnected {
                peer: self.remote.clone(),
            });
        }
        let mut inbound = self.inbound_rx.lock().await;
        inbound.recv().await.unwrap_or(Err(TransportError::Closed))
    }
}

/// A seeding peer: an [`UploadManager`] serving one file from a temp directory.
pub struct ServingPeer {
    peer_id: PeerId,
    manager: Arc<UploadManager>,
    catalog: Arc<InMemoryCatalog>,
    path: PathBuf,
    _dir: tempfile::TempDir,
}

impl ServingPeer {
    /// Writes `data` to disk and offers it as `content`.
    ///
    /// # Panics
    ///
    /// Panics if the temporary file cannot be created. This is acceptable in
    /// test fixtures where failures indicate environment issues.
    pub async fn new(peer: &str, content: &str, data: &[u8], config: UploadConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{content}.bin"));
        tokio::fs::write(&path, data).await.unwrap();

        let content_id = ContentId::new(content);
        let servable = ServableContent::from_file(
            content_id.clone(),
            VariantId::new(format!("{content}-source")),
            &path,
            1080,
        )
        .await
        .unwrap();

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(servable);
        let peer_id = PeerId::new(peer);
        let manager = Arc::new(UploadManager::new(peer_id.clone(), config, catalog.clone()));

        Self {
            peer_id,
            manager,
            catalog,
            path,
            _dir: dir,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn manager(&self) -> &Arc<UploadManager> {
        &self.manager
    }

    pub fn catalog(&self) -> &Arc<InMemoryCatalog> {
        &self.catalog
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport a downloader named `local` uses to reach this peer.
    pub fn transport_for(&self, local: &str) -> MockPeerTransport {
        MockPeerTransport::serving(
            self.peer_id.clone(),
            PeerId::new(local),
            Arc::clone(&self.manager),
        )
    }
}
