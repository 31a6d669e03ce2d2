//! Swarm coordination
//!
//! A [`Swarm`] owns everything shared across peer connections for one
//! torrent: the piece availability table, the piece store, transfer
//! counters, and the event channels. Each connected peer runs as its own
//! tokio task; the swarm spawns them, hands them the shared state, and
//! reaps them when they exit. Completed pieces are verified against
//! their expected digest, persisted, and announced to every live session
//! over the have relay.

pub mod availability;
mod peer;
pub mod slices;
pub mod upload;

pub use availability::{PieceAvailability, Selection};
pub use slices::{ChunkProgress, LossOutcome, PieceAssembly, Slice, SliceScheduler};
pub use upload::UploadPipeline;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::metainfo::TorrentInfo;
use crate::storage::PieceStore;

/// Identifier of one peer session within a swarm
pub type SessionId = u64;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const HAVE_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Client identifier prefix in Azureus style
const PEER_ID_PREFIX: &[u8; 8] = b"-PW0001-";

/// Events emitted by a [`Swarm`]
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A peer session reached its steady state
    PeerConnected { session: SessionId, addr: SocketAddr },

    /// A peer session ended, for any reason
    PeerDisconnected { session: SessionId, addr: SocketAddr },

    /// A piece was downloaded, verified, and persisted
    PieceCompleted { index: u32 },

    /// A downloaded piece failed verification or could not be persisted
    PieceFailed { index: u32 },

    /// Every piece is now held locally
    DownloadComplete,
}

/// Transfer totals and progress counters
#[derive(Debug, Clone, Copy)]
pub struct SwarmStats {
    /// Piece payload bytes received
    pub downloaded: u64,

    /// Piece payload bytes served
    pub uploaded: u64,

    /// Live peer sessions
    pub peers: usize,

    /// Pieces held and verified locally
    pub have_pieces: u32,

    /// Total pieces in the torrent
    pub piece_count: u32,
}

/// State shared between the swarm handle and its session tasks
pub(crate) struct SwarmShared {
    pub(crate) info: Arc<TorrentInfo>,
    pub(crate) config: SwarmConfig,
    pub(crate) store: Arc<dyn PieceStore>,
    pub(crate) availability: Mutex<PieceAvailability>,
    pub(crate) peer_id: [u8; 20],
    pub(crate) event_tx: broadcast::Sender<SwarmEvent>,
    pub(crate) have_tx: broadcast::Sender<u32>,
    pub(crate) downloaded: AtomicU64,
    pub(crate) uploaded: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_session: AtomicU64,
}

struct SessionHandle {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl SwarmShared {
    /// Verify, persist, and announce a fully assembled piece.
    ///
    /// Returns `Ok(false)` when another session completed the piece
    /// first; the caller's copy is simply discarded. `owned` marks the
    /// caller as the claiming session: on failure its claim is released
    /// back to idle, while duplicate pullers never touch the claim.
    pub(crate) async fn complete_piece(
        &self,
        index: u32,
        data: Bytes,
        owned: bool,
    ) -> Result<bool> {
        if self.availability.lock().have(index) {
            return Ok(false);
        }

        let expected = self.info.piece_hash(index).ok_or_else(|| {
            SwarmError::invalid_input("index", format!("Piece {} out of range", index))
        })?;
        let digest: [u8; 20] = Sha1::digest(&data).into();
        if digest != *expected {
            if owned {
                self.release_claim(index);
            }
            let _ = self.event_tx.send(SwarmEvent::PieceFailed { index });
            return Err(SwarmError::Integrity { index });
        }

        if let Err(err) = self.store.write_piece(index, data).await {
            if owned {
                self.release_claim(index);
            }
            let _ = self.event_tx.send(SwarmEvent::PieceFailed { index });
            return Err(err);
        }

        let complete = {
            let mut availability = self.availability.lock();
            if availability.have(index) {
                // Lost the race during the store write
                return Ok(false);
            }
            availability.mark_have(index)?;
            availability.is_complete()
        };

        let _ = self.have_tx.send(index);
        let _ = self.event_tx.send(SwarmEvent::PieceCompleted { index });
        if complete {
            info!("Download complete");
            let _ = self.event_tx.send(SwarmEvent::DownloadComplete);
        }
        Ok(true)
    }

    fn release_claim(&self, index: u32) {
        let mut availability = self.availability.lock();
        if availability.is_in_flight(index) {
            if let Err(err) = availability.release(index) {
                warn!(piece = index, error = %err, "Release failed");
            }
        }
    }
}

/// Data-exchange coordinator for one torrent.
///
/// Create one per torrent, point peer connections at it, and watch the
/// event stream:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use peerwire::{MemoryStore, Swarm, SwarmConfig, SwarmEvent, TorrentInfo};
/// # async fn example(info: TorrentInfo) -> peerwire::Result<()> {
/// let store = Arc::new(MemoryStore::new(info.piece_count()));
/// let swarm = Swarm::new(info, store, SwarmConfig::default())?;
///
/// let mut events = swarm.subscribe();
/// swarm.connect("127.0.0.1:6881".parse().unwrap())?;
///
/// while let Ok(event) = events.recv().await {
///     if matches!(event, SwarmEvent::DownloadComplete) {
///         break;
///     }
/// }
/// swarm.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Swarm {
    shared: Arc<SwarmShared>,
}

impl Swarm {
    /// Create a swarm for one torrent. Fails if the configuration is
    /// invalid.
    pub fn new(
        info: TorrentInfo,
        store: Arc<dyn PieceStore>,
        config: SwarmConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (have_tx, _) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        let piece_count = info.piece_count();

        Ok(Self {
            shared: Arc::new(SwarmShared {
                info: Arc::new(info),
                config,
                store,
                availability: Mutex::new(PieceAvailability::new(piece_count)),
                peer_id: generate_peer_id(),
                event_tx,
                have_tx,
                downloaded: AtomicU64::new(0),
                uploaded: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    /// Torrent metadata this swarm exchanges data for
    pub fn info(&self) -> &TorrentInfo {
        &self.shared.info
    }

    /// The local peer id sent in handshakes
    pub fn peer_id(&self) -> [u8; 20] {
        self.shared.peer_id
    }

    /// Scan the piece store and mark every piece whose stored bytes match
    /// the expected digest. Run this before connecting peers when the
    /// store may hold data from an earlier run. Returns the number of
    /// pieces verified.
    pub async fn verify_existing(&self) -> Result<u32> {
        let mut verified = 0;
        for index in 0..self.shared.info.piece_count() {
            if self.shared.availability.lock().have(index) {
                continue;
            }
            let piece = match self.shared.store.read_piece(index).await {
                Ok(piece) => piece,
                Err(_) => continue,
            };
            if piece.len() != self.shared.info.piece_len(index) as usize {
                continue;
            }
            let Some(expected) = self.shared.info.piece_hash(index) else {
                continue;
            };
            let digest: [u8; 20] = Sha1::digest(&piece).into();
            if digest == *expected {
                self.shared.availability.lock().mark_have(index)?;
                verified += 1;
            }
        }
        if verified > 0 {
            info!(
                pieces = verified,
                total = self.shared.info.piece_count(),
                "Verified existing pieces"
            );
        }
        Ok(verified)
    }

    /// Open an outbound connection to a peer. The session runs as its
    /// own task; progress surfaces through [`Swarm::subscribe`].
    pub fn connect(&self, addr: SocketAddr) -> Result<SessionId> {
        self.spawn_session(addr, None)
    }

    /// Adopt an already-accepted inbound connection
    pub fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<SessionId> {
        self.spawn_session(addr, Some(stream))
    }

    fn spawn_session(&self, addr: SocketAddr, inbound: Option<TcpStream>) -> Result<SessionId> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SwarmError::Shutdown);
        }

        let mut sessions = self.shared.sessions.lock();
        if sessions.len() >= self.shared.config.max_peers {
            return Err(SwarmError::ResourceLimit {
                resource: "peer sessions",
                limit: self.shared.config.max_peers,
            });
        }

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            match peer::run(Arc::clone(&shared), id, addr, inbound).await {
                Ok(()) => debug!(session = id, peer = %addr, "Peer session ended"),
                Err(err) => {
                    debug!(session = id, peer = %addr, error = %err, "Peer session failed")
                }
            }
            shared.sessions.lock().remove(&id);
            let _ = shared
                .event_tx
                .send(SwarmEvent::PeerDisconnected { session: id, addr });
        });
        sessions.insert(id, SessionHandle { addr, task });
        Ok(id)
    }

    /// Subscribe to swarm events
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Snapshot of transfer totals and progress
    pub fn stats(&self) -> SwarmStats {
        let availability = self.shared.availability.lock();
        SwarmStats {
            downloaded: self.shared.downloaded.load(Ordering::Relaxed),
            uploaded: self.shared.uploaded.load(Ordering::Relaxed),
            peers: self.shared.sessions.lock().len(),
            have_pieces: availability.have_count(),
            piece_count: availability.piece_count(),
        }
    }

    /// Whether every piece is held locally
    pub fn is_complete(&self) -> bool {
        self.shared.availability.lock().is_complete()
    }

    /// Whether one piece is held and verified locally
    pub fn have(&self, index: u32) -> bool {
        index < self.shared.info.piece_count() && self.shared.availability.lock().have(index)
    }

    /// The local bitfield in wire layout
    pub fn bitfield(&self) -> Bytes {
        self.shared.availability.lock().bitfield_bytes()
    }

    /// Number of live peer sessions
    pub fn peer_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Addresses of the currently connected peers
    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .sessions
            .lock()
            .values()
            .map(|handle| handle.addr)
            .collect()
    }

    /// Stop every session and refuse new connections. Sessions get a
    /// short grace period to park their in-flight pieces, then are
    /// aborted.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.shared.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle.task)
                .await
                .is_err()
            {
                handle.task.abort();
            }
        }
    }
}

fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    for byte in &mut id[8..] {
        *byte = rand::random();
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn single_piece_swarm(data: &[u8]) -> Swarm {
        let hash: [u8; 20] = Sha1::digest(data).into();
        let info = TorrentInfo::new(
            [7u8; 20],
            vec![hash],
            data.len() as u32,
            data.len() as u64,
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new(1));
        Swarm::new(info, store, SwarmConfig::default()).unwrap()
    }

    #[test]
    fn test_peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);

        // Random suffixes should differ between ids
        assert_ne!(generate_peer_id()[8..], generate_peer_id()[8..]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let info = TorrentInfo::new([0u8; 20], vec![[1u8; 20]], 1024, 1024).unwrap();
        let store = Arc::new(MemoryStore::new(1));
        let config = SwarmConfig::new().pipeline_depth(0);
        assert!(Swarm::new(info, store, config).is_err());
    }

    #[tokio::test]
    async fn test_complete_piece_verifies_and_marks_have() {
        let data = b"piece payload".to_vec();
        let swarm = single_piece_swarm(&data);
        swarm
            .shared
            .availability
            .lock()
            .select_piece(&mut vec![0])
            .unwrap();

        let mut events = swarm.subscribe();
        let accepted = swarm
            .shared
            .complete_piece(0, Bytes::from(data.clone()), true)
            .await
            .unwrap();

        assert!(accepted);
        assert!(swarm.have(0));
        assert!(swarm.is_complete());
        assert_eq!(
            swarm.shared.store.read_piece(0).await.unwrap().as_ref(),
            data.as_slice()
        );
        assert!(matches!(
            events.recv().await,
            Ok(SwarmEvent::PieceCompleted { index: 0 })
        ));
        assert!(matches!(events.recv().await, Ok(SwarmEvent::DownloadComplete)));
    }

    #[tokio::test]
    async fn test_complete_piece_rejects_bad_digest() {
        let swarm = single_piece_swarm(b"expected bytes");
        swarm
            .shared
            .availability
            .lock()
            .select_piece(&mut vec![0])
            .unwrap();

        let result = swarm
            .shared
            .complete_piece(0, Bytes::from_static(b"corrupted bytes"), true)
            .await;

        assert!(matches!(result, Err(SwarmError::Integrity { index: 0 })));
        assert!(!swarm.have(0));
        // The claim went back to idle, so the piece is selectable again
        assert!(swarm
            .shared
            .availability
            .lock()
            .select_piece(&mut vec![0])
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_completion_discarded() {
        let data = b"raced piece".to_vec();
        let swarm = single_piece_swarm(&data);
        swarm.shared.availability.lock().mark_have(0).unwrap();

        let accepted = swarm
            .shared
            .complete_piece(0, Bytes::from(data), false)
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_verify_existing_marks_matching_pieces() {
        let data = b"already on disk".to_vec();
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let info = TorrentInfo::new(
            [7u8; 20],
            vec![hash, [0u8; 20]],
            data.len() as u32,
            2 * data.len() as u64,
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new(2));
        store
            .write_piece(0, Bytes::from(data))
            .await
            .unwrap();

        let swarm = Swarm::new(info, store, SwarmConfig::default()).unwrap();
        assert_eq!(swarm.verify_existing().await.unwrap(), 1);
        assert!(swarm.have(0));
        assert!(!swarm.have(1));
    }

    #[tokio::test]
    async fn test_verify_existing_rescan_skips_held_pieces() {
        let data = b"scanned twice".to_vec();
        let swarm = single_piece_swarm(&data);
        swarm
            .shared
            .store
            .write_piece(0, Bytes::from(data))
            .await
            .unwrap();

        assert_eq!(swarm.verify_existing().await.unwrap(), 1);
        // A rescan leaves held pieces alone instead of tripping over them
        assert_eq!(swarm.verify_existing().await.unwrap(), 0);
        assert!(swarm.have(0));
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let swarm = single_piece_swarm(b"data");
        let stats = swarm.stats();
        assert_eq!(stats.downloaded, 0);
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.peers, 0);
        assert_eq!(stats.have_pieces, 0);
        assert_eq!(stats.piece_count, 1);
    }
}
