use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;

use crate::bitfield::Bitfield;
use crate::peer::extended::ExtendedHandshake;
use crate::peer::peer::Peer;
use crate::torrent::TorrentId;

/// Identifies one peer connection within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub torrent: TorrentId,
    pub peer: Peer,
}

impl ConnectionKey {
    pub fn new(torrent: TorrentId, peer: Peer) -> Self {
        Self { torrent, peer }
    }
}

/// Identifies one block exchange within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Counters and flags read from outside the connection worker.
///
/// The worker owns everything else in `ConnectionState`; these live in
/// an `Arc` so the choker and the registry can observe throughput and
/// request a close without touching the worker's state.
#[derive(Debug, Default)]
pub struct SharedConnectionStats {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    last_active_ms: AtomicU64,
    should_choke: AtomicBool,
    peer_interested: AtomicBool,
    close_requested: AtomicBool,
}

impl SharedConnectionStats {
    pub fn new() -> Self {
        Self {
            should_choke: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Stamps activity now; `last_active` never goes backwards.
    pub fn touch(&self) {
        let now = Local::now().timestamp_millis() as u64;
        self.last_active_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn set_should_choke(&self, choke: bool) {
        self.should_choke.store(choke, Ordering::Relaxed);
    }

    pub fn should_choke(&self) -> bool {
        self.should_choke.load(Ordering::Relaxed)
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.peer_interested.store(interested, Ordering::Relaxed);
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Relaxed);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Relaxed)
    }
}

/// Typed per-extension state, one fixed field per known extension.
#[derive(Debug, Default, Clone)]
pub struct ExtensionState {
    /// Accumulated extended handshake of the remote; merges stay
    /// additive across re-handshakes.
    pub handshake: Option<ExtendedHandshake>,
}

impl ExtensionState {
    /// Folds a received handshake in, keeping earlier advertisements.
    pub fn merge_handshake(&mut self, incoming: ExtendedHandshake) {
        match &mut self.handshake {
            Some(handshake) => handshake.merge(incoming),
            None => self.handshake = Some(incoming),
        }
    }

    pub fn ut_pex_id(&self) -> Option<u8> {
        self.handshake.as_ref().and_then(|h| h.ut_pex_id())
    }
}

/// Mutable record of one peer connection, owned exclusively by its
/// worker thread.
///
/// Initial flags per the protocol: both sides choking, neither side
/// interested.
#[derive(Debug)]
pub struct ConnectionState {
    pub key: ConnectionKey,
    /// We are choking the peer.
    pub choking: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    /// We are interested in the peer.
    pub interested: bool,
    /// The peer is interested in us.
    pub peer_interested: bool,
    /// What the peer advertised (bitfield plus HAVEs).
    pub peer_bitfield: Bitfield,
    /// What we last advertised to the peer, for HAVE diffing.
    pub advertised: Bitfield,
    /// Blocks we asked for and have not yet received or cancelled.
    pub pending_requests: HashSet<BlockKey>,
    /// Upload requests the peer cancelled; drops queued blocks.
    pub cancelled: HashSet<BlockKey>,
    /// Upload requests accepted and handed to the I/O pool.
    pub queued_uploads: HashSet<BlockKey>,
    /// When we last flipped the peer's choke state.
    pub last_choked: Option<Instant>,
    pub extensions: ExtensionState,
    shared: Arc<SharedConnectionStats>,
}

impl ConnectionState {
    pub fn new(key: ConnectionKey, piece_count: usize, shared: Arc<SharedConnectionStats>) -> Self {
        Self {
            key,
            choking: true,
            peer_choking: true,
            interested: false,
            peer_interested: false,
            peer_bitfield: Bitfield::new(piece_count),
            advertised: Bitfield::new(piece_count),
            pending_requests: HashSet::new(),
            cancelled: HashSet::new(),
            queued_uploads: HashSet::new(),
            last_choked: None,
            extensions: ExtensionState::default(),
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedConnectionStats> {
        &self.shared
    }

    /// The peer choked us: every locally pending request is void and
    /// its blocks return to the pool. Returns the cleared keys.
    pub fn on_peer_choke(&mut self) -> Vec<BlockKey> {
        self.peer_choking = true;
        self.pending_requests.drain().collect()
    }

    pub fn on_peer_unchoke(&mut self) {
        self.peer_choking = false;
    }

    pub fn on_peer_interested(&mut self) {
        self.peer_interested = true;
        self.shared.set_peer_interested(true);
    }

    pub fn on_peer_not_interested(&mut self) {
        self.peer_interested = false;
        self.shared.set_peer_interested(false);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.shared.add_downloaded(bytes);
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.shared.add_uploaded(bytes);
    }
}
