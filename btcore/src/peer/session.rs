use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bitfield::{Bitfield, BitfieldError};
use crate::config::cfg::Cfg;
use crate::event::{Event, EventBus};
use crate::peer::connection::{BlockKey, ConnectionKey, ConnectionState, SharedConnectionStats};
use crate::peer::extended::{ExtendedHandshake, EXTENDED_HANDSHAKE_ID, LOCAL_UT_PEX_ID};
use crate::peer::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
use crate::peer::message::{Message, MessageError};
use crate::peer::peer::Peer;
use crate::peer::pool::{ConnectionPool, ConnectionPoolError};
use crate::pex::message::PexMessage;
use crate::pex::source::{PexSource, PexSourceError, CLEANUP_INTERVAL};
use crate::scheduler::assignments::Assignments;
use crate::scheduler::choker::{Choker, PeerThroughput};
use crate::scheduler::selector::{PieceSelector, SelectionStrategy};
use crate::scheduler::stats::{PieceStatistics, PieceStatisticsError};
use crate::storage::assembler::{AssemblerError, BlockAssembler, BlockOutcome};
use crate::storage::descriptor::{DataDescriptor, DataDescriptorError};
use crate::storage::io_pool::{BlockRead, IoPool, IoPoolError};
use crate::torrent::Torrent;

/// Upper bound a socket read blocks before the loop re-checks the
/// close flag and runs a producer pass.
pub const WAIT_BETWEEN_READS: Duration = Duration::from_millis(100);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Bytes pulled from the socket per read.
const READ_CHUNK: usize = 17 * 1024;

/// Posible peer session errors.
#[derive(Debug)]
pub enum PeerSessionError {
    CouldNotConnectToPeer,
    ErrorSettingStreamTimeout,
    ErrorReadingHandshake(io::Error),
    InvalidHandshake(HandshakeError),
    WrongInfoHash,
    PeerIsOurself,
    ErrorReadingMessage(io::Error),
    ErrorSendingMessage(io::Error),
    ProtocolError(MessageError),
    InvalidBitfield(BitfieldError),
    InvalidBlock(AssemblerError),
    PoolError(ConnectionPoolError),
    StorageError(DataDescriptorError),
    StatsError(PieceStatisticsError),
    PexError(PexSourceError),
    IoPoolError(IoPoolError),
    PoisonedSchedulerLock,
}

/// Everything the per-peer workers of one torrent share.
///
/// Built once per registered torrent; sessions, the acceptor and the
/// timer thread all hold it behind an `Arc`.
pub struct SessionContext {
    pub config: Cfg,
    pub torrent: Torrent,
    pub data: Arc<DataDescriptor>,
    pub stats: Mutex<PieceStatistics>,
    pub assignments: Mutex<Assignments>,
    pub pool: Arc<ConnectionPool>,
    pub pex: Arc<PexSource>,
    pub io: Arc<IoPool>,
    pub bus: Arc<EventBus>,
    pub client_peer_id: [u8; 20],
    choker: Mutex<Choker>,
    counters: Mutex<HashMap<ConnectionKey, u64>>,
    stopped: AtomicBool,
}

impl SessionContext {
    /// Builds the shared state of one torrent and wires swarm
    /// membership events into its PEX source.
    pub fn new(
        torrent: Torrent,
        data: Arc<DataDescriptor>,
        config: Cfg,
        bus: Arc<EventBus>,
        io: Arc<IoPool>,
        client_peer_id: [u8; 20],
    ) -> Arc<Self> {
        let piece_count = torrent.total_pieces() as usize;
        let pool = Arc::new(ConnectionPool::new(
            config.max_peers_per_torrent as usize,
            bus.clone(),
        ));
        let pex = Arc::new(PexSource::new(&config));

        let selector = PieceSelector::new(SelectionStrategy::RandomizedRarest);
        let context = Arc::new(Self {
            stats: Mutex::new(PieceStatistics::new(piece_count)),
            assignments: Mutex::new(Assignments::new(selector, &config)),
            choker: Mutex::new(Choker::new(config.optimistic_unchoke_every)),
            counters: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            pool,
            pex: pex.clone(),
            io,
            bus: bus.clone(),
            client_peer_id,
            config,
            torrent,
            data,
        });

        let torrent_id = context.torrent.id;
        bus.subscribe(move |event| match event {
            Event::PeerConnected { torrent, peer } if *torrent == torrent_id => {
                if let Err(err) = pex.peer_added(*torrent, *peer, Instant::now()) {
                    warn!("PEX add event lost: {:?}", err);
                }
            }
            Event::PeerDisconnected { torrent, peer } if *torrent == torrent_id => {
                if let Err(err) = pex.peer_dropped(*torrent, *peer, Instant::now()) {
                    warn!("PEX drop event lost: {:?}", err);
                }
            }
            Event::TorrentStopped { torrent } if *torrent == torrent_id => {
                let _ = pex.drain_torrent(torrent);
            }
            _ => {}
        });

        context
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Stops the torrent: sessions observe the flag and close, the PEX
    /// queue drains.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Err(err) = self.pool.close_torrent(&self.torrent.id) {
            warn!("Closing connections of {} failed: {:?}", self.torrent.id, err);
        }
        let _ = self.pex.drain_torrent(&self.torrent.id);
    }

    /// One choker round: rank connections by throughput delta since
    /// the previous round and refresh every `should_choke` flag.
    pub fn choke_tick(&self) -> Result<(), PeerSessionError> {
        let snapshot = self
            .pool
            .snapshot(&self.torrent.id)
            .map_err(PeerSessionError::PoolError)?;
        let seeding = self.data.is_complete().unwrap_or(false);

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| PeerSessionError::PoisonedSchedulerLock)?;
        let throughput: Vec<PeerThroughput> = snapshot
            .iter()
            .map(|(key, shared)| {
                let total = if seeding {
                    shared.uploaded()
                } else {
                    shared.downloaded()
                };
                let previous = counters.insert(*key, total).unwrap_or(0);
                PeerThroughput {
                    peer: key.peer,
                    interested: shared.peer_interested(),
                    currently_choked: shared.should_choke(),
                    delta_bytes: total.saturating_sub(previous),
                }
            })
            .collect();
        drop(counters);

        let decisions = self
            .choker
            .lock()
            .map_err(|_| PeerSessionError::PoisonedSchedulerLock)?
            .run_tick(throughput);

        let by_peer: HashMap<Peer, Arc<SharedConnectionStats>> = snapshot
            .into_iter()
            .map(|(key, shared)| (key.peer, shared))
            .collect();
        for decision in decisions {
            if let Some(shared) = by_peer.get(&decision.peer) {
                shared.set_should_choke(decision.should_choke);
            }
        }
        Ok(())
    }

    /// Requeues assignments whose deadline passed.
    pub fn expire_assignments(&self) -> Result<(), PeerSessionError> {
        let expired = self
            .assignments
            .lock()
            .map_err(|_| PeerSessionError::PoisonedSchedulerLock)?
            .expire(Instant::now());
        for (peer, piece) in expired {
            debug!("Reclaiming piece {} from {}", piece, peer);
        }
        Ok(())
    }
}

/// Spawns the torrent's timer thread: choker ticks, PEX cleanup and
/// assignment expiry on one schedule.
pub fn spawn_timer(context: Arc<SessionContext>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("Torrent: {} / timer", context.torrent.name()))
        .spawn(move || {
            let mut seconds = 0u64;
            while !context.is_stopped() {
                thread::sleep(Duration::from_secs(1));
                seconds += 1;
                if seconds % context.config.choke_interval_seconds == 0 {
                    if let Err(err) = context.choke_tick() {
                        warn!("Choker tick failed: {:?}", err);
                    }
                }
                if seconds % CLEANUP_INTERVAL.as_secs() == 0 {
                    if let Err(err) = context.pex.cleanup(Instant::now()) {
                        warn!("PEX cleanup failed: {:?}", err);
                    }
                }
                if let Err(err) = context.expire_assignments() {
                    warn!("Assignment expiry failed: {:?}", err);
                }
            }
        })
}

/// A PeerSession drives one peer connection: it decodes incoming
/// traffic, updates the shared torrent state, and emits the outgoing
/// messages its producer pass decides on.
pub struct PeerSession {
    context: Arc<SessionContext>,
    peer: Peer,
    assembler: BlockAssembler,
    inbound: Vec<u8>,
    completed_tx: Sender<BlockRead>,
    completed_rx: Receiver<BlockRead>,
    last_message_sent: Instant,
}

impl PeerSession {
    pub fn new(peer: Peer, context: Arc<SessionContext>) -> Self {
        let (completed_tx, completed_rx) = channel();
        let block_size = context.config.block_size;
        Self {
            context,
            peer,
            assembler: BlockAssembler::new(block_size),
            inbound: Vec::new(),
            completed_tx,
            completed_rx,
            last_message_sent: Instant::now(),
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Connection setup

    /// Connects out to the peer, handshakes, and runs the session
    /// until the connection ends.
    pub fn start_outgoing(&mut self) -> Result<(), PeerSessionError> {
        let mut stream = TcpStream::connect((self.peer.ip, self.peer.port))
            .map_err(|_| PeerSessionError::CouldNotConnectToPeer)?;
        self.set_stream_timeouts(&mut stream)?;

        let local = Handshake::new(self.context.torrent.id, self.context.client_peer_id);
        stream
            .write_all(&local.to_bytes())
            .map_err(PeerSessionError::ErrorSendingMessage)?;

        let remote = self.read_handshake(&mut stream)?;
        if remote.info_hash != self.context.torrent.id {
            return Err(PeerSessionError::WrongInfoHash);
        }
        // Avoid looping traffic back to ourself.
        if remote.peer_id == self.context.client_peer_id {
            return Err(PeerSessionError::PeerIsOurself);
        }
        info!("Handshake with {} successful", self.peer);

        self.run(stream, remote)
    }

    /// Serves a connection accepted by the listener; the acceptor
    /// already consumed and routed the remote handshake.
    pub fn start_incoming(
        &mut self,
        mut stream: TcpStream,
        remote: Handshake,
    ) -> Result<(), PeerSessionError> {
        if remote.info_hash != self.context.torrent.id {
            return Err(PeerSessionError::WrongInfoHash);
        }
        self.set_stream_timeouts(&mut stream)?;

        let local = Handshake::new(self.context.torrent.id, self.context.client_peer_id);
        stream
            .write_all(&local.to_bytes())
            .map_err(PeerSessionError::ErrorSendingMessage)?;
        info!("Handshake with {} successful", self.peer);

        self.run(stream, remote)
    }

    fn read_handshake(&self, stream: &mut TcpStream) -> Result<Handshake, PeerSessionError> {
        let mut buffer = [0; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buffer)
            .map_err(PeerSessionError::ErrorReadingHandshake)?;
        Handshake::from_bytes(&buffer).map_err(PeerSessionError::InvalidHandshake)
    }

    fn set_stream_timeouts(&self, stream: &mut TcpStream) -> Result<(), PeerSessionError> {
        let timeout = Duration::from_secs(self.context.config.read_write_seconds_timeout);
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|_| PeerSessionError::ErrorSettingStreamTimeout)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|_| PeerSessionError::ErrorSettingStreamTimeout)?;
        Ok(())
    }

    // ------------------------------------------------------------------------------------------------
    // Main loop

    fn run(&mut self, mut stream: TcpStream, remote: Handshake) -> Result<(), PeerSessionError> {
        let key = ConnectionKey::new(self.context.torrent.id, self.peer);
        let shared = self
            .context
            .pool
            .add(key)
            .map_err(PeerSessionError::PoolError)?;
        let mut state = ConnectionState::new(
            key,
            self.context.torrent.total_pieces() as usize,
            shared,
        );

        let result = self.run_wrap(&mut stream, &mut state, &remote);
        self.disconnect(&mut state);
        result
    }

    fn run_wrap(
        &mut self,
        stream: &mut TcpStream,
        state: &mut ConnectionState,
        remote: &Handshake,
    ) -> Result<(), PeerSessionError> {
        if remote.supports_extended_messaging() {
            let handshake = ExtendedHandshake::local(&self.context.config);
            self.send(
                stream,
                Message::Extended {
                    id: EXTENDED_HANDSHAKE_ID,
                    payload: handshake.to_bytes(),
                },
            )?;
        }

        let verified = self
            .context
            .data
            .verified()
            .map_err(PeerSessionError::StorageError)?;
        self.send(stream, Message::Bitfield(verified.to_vec()))?;
        state.advertised = verified;

        stream
            .set_read_timeout(Some(WAIT_BETWEEN_READS))
            .map_err(|_| PeerSessionError::ErrorSettingStreamTimeout)?;

        let mut closing = false;
        loop {
            if state.shared().close_requested() || self.context.is_stopped() {
                debug!("Session with {} asked to close", self.peer);
                return Ok(());
            }

            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => closing = true,
                Ok(count) => {
                    self.inbound.extend_from_slice(&chunk[..count]);
                    state.shared().touch();
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(PeerSessionError::ErrorReadingMessage(err)),
            }

            loop {
                let decoded =
                    Message::decode(&self.inbound).map_err(PeerSessionError::ProtocolError)?;
                match decoded {
                    Some((message, consumed)) => {
                        self.inbound.drain(..consumed);
                        self.handle_message(state, message)?;
                    }
                    None => break,
                }
            }

            self.producer_pass(stream, state)?;

            if closing {
                debug!("Peer {} closed the connection", self.peer);
                return Ok(());
            }
        }
    }

    fn disconnect(&mut self, state: &mut ConnectionState) {
        if let Ok(mut stats) = self.context.stats.lock() {
            let _ = stats.peer_disconnected(&state.peer_bitfield);
        }
        if let Ok(mut assignments) = self.context.assignments.lock() {
            let returned = assignments.release_peer(&self.peer);
            if !returned.is_empty() {
                debug!("{} returned pieces {:?} to the pool", self.peer, returned);
            }
        }
        if let Err(err) = self.context.pex.unregister(&state.key) {
            warn!("PEX unregister of {} failed: {:?}", self.peer, err);
        }
        if let Err(err) = self.context.pool.remove(&state.key) {
            warn!("Pool removal of {} failed: {:?}", self.peer, err);
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Consumer side

    fn handle_message(
        &mut self,
        state: &mut ConnectionState,
        message: Message,
    ) -> Result<(), PeerSessionError> {
        match message {
            Message::KeepAlive => state.shared().touch(),
            Message::Choke => {
                let cleared = state.on_peer_choke();
                if !cleared.is_empty() {
                    debug!("{} choked us; {} requests voided", self.peer, cleared.len());
                }
            }
            Message::Unchoke => state.on_peer_unchoke(),
            Message::Interested => state.on_peer_interested(),
            Message::NotInterested => state.on_peer_not_interested(),
            Message::Have { index } => {
                state
                    .peer_bitfield
                    .set_bit(index, true)
                    .map_err(PeerSessionError::InvalidBitfield)?;
                self.lock_stats()?
                    .peer_have(index)
                    .map_err(PeerSessionError::StatsError)?;
            }
            Message::Bitfield(bytes) => {
                let bitfield =
                    Bitfield::from_bytes(bytes, self.context.torrent.total_pieces() as usize)
                        .map_err(PeerSessionError::InvalidBitfield)?;
                let mut stats = self.lock_stats()?;
                // A re-sent bitfield replaces the old advertisement.
                stats
                    .peer_disconnected(&state.peer_bitfield)
                    .map_err(PeerSessionError::StatsError)?;
                stats
                    .peer_bitfield(&bitfield)
                    .map_err(PeerSessionError::StatsError)?;
                drop(stats);
                state.peer_bitfield = bitfield;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(state, index, begin, length)?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.handle_piece(state, index, begin, block)?,
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                state.cancelled.insert(BlockKey {
                    index,
                    begin,
                    length,
                });
            }
            // The DHT is an external collaborator.
            Message::Port(_) => {}
            Message::Extended { id, payload } => {
                if id == EXTENDED_HANDSHAKE_ID {
                    self.handle_extended_handshake(state, &payload)?;
                } else if id == LOCAL_UT_PEX_ID {
                    self.handle_pex(&payload);
                } else {
                    debug!("Unknown extended subtype {} from {}", id, self.peer);
                }
            }
        }
        Ok(())
    }

    /// Serves an incoming block request through the I/O pool.
    fn handle_request(
        &mut self,
        state: &mut ConnectionState,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), PeerSessionError> {
        if state.choking {
            debug!("Request from {} while choked, dropped", self.peer);
            return Ok(());
        }
        if length == 0 || length > self.context.config.block_size {
            debug!("Request from {} with bad length {}, dropped", self.peer, length);
            return Ok(());
        }

        let key = BlockKey {
            index,
            begin,
            length,
        };
        // A re-request voids an earlier cancel of the same block.
        state.cancelled.remove(&key);

        let bound = 2 * self.context.config.max_pending_requests_per_peer as usize;
        if state.queued_uploads.len() >= bound {
            debug!("Upload queue of {} full, request dropped", self.peer);
            return Ok(());
        }
        if !state.queued_uploads.insert(key) {
            return Ok(());
        }

        self.context
            .io
            .submit_read(
                self.context.data.clone(),
                index,
                begin,
                length,
                self.completed_tx.clone(),
            )
            .map_err(PeerSessionError::IoPoolError)
    }

    /// Buffers an incoming block and, on piece completion, verifies
    /// and commits it.
    fn handle_piece(
        &mut self,
        state: &mut ConnectionState,
        index: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<(), PeerSessionError> {
        let key = BlockKey {
            index,
            begin,
            length: block.len() as u32,
        };
        if !state.pending_requests.remove(&key) {
            debug!("Unsolicited block {}:{} from {}, dropped", index, begin, self.peer);
            return Ok(());
        }
        state.record_downloaded(block.len() as u64);

        let piece_size = match self.context.torrent.piece_size(index) {
            Ok(piece_size) => piece_size,
            Err(_) => return Ok(()),
        };
        match self
            .assembler
            .add_block(index, begin, &block, piece_size)
            .map_err(PeerSessionError::InvalidBlock)?
        {
            BlockOutcome::Incomplete | BlockOutcome::Duplicate => Ok(()),
            BlockOutcome::Complete(piece) => self.complete_piece(index, piece),
        }
    }

    fn complete_piece(&mut self, index: u32, piece: Vec<u8>) -> Result<(), PeerSessionError> {
        match self.context.data.commit_piece(index, &piece) {
            Ok(true) => {
                let done = self
                    .context
                    .data
                    .verified()
                    .map_err(PeerSessionError::StorageError)?
                    .count_set();
                info!(
                    "*** Torrent: {} - Pieces downloaded: {} / {}",
                    self.context.torrent.name(),
                    done,
                    self.context.torrent.total_pieces()
                );
                self.context.bus.emit(Event::PieceVerified {
                    torrent: self.context.torrent.id,
                    piece: index,
                });
                let losers = self.lock_assignments()?.mark_verified(index);
                for loser in losers.iter().filter(|loser| **loser != self.peer) {
                    debug!("Endgame race for piece {} lost by {}", index, loser);
                }
                if self.context.data.is_complete().unwrap_or(false) {
                    self.context.bus.emit(Event::DownloadComplete {
                        torrent: self.context.torrent.id,
                    });
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(DataDescriptorError::HashMismatch(_)) => {
                warn!(
                    "Piece {} from {} failed verification, discarded",
                    index, self.peer
                );
                self.assembler.discard(index);
                self.lock_assignments()?.fail(&self.peer, index);
                Ok(())
            }
            Err(DataDescriptorError::Io(err)) => {
                warn!("Commit of piece {} failed: {}; will retry", index, err);
                self.assembler.discard(index);
                self.lock_assignments()?.fail(&self.peer, index);
                Ok(())
            }
            Err(err) => Err(PeerSessionError::StorageError(err)),
        }
    }

    fn handle_extended_handshake(
        &mut self,
        state: &mut ConnectionState,
        payload: &[u8],
    ) -> Result<(), PeerSessionError> {
        let incoming = match ExtendedHandshake::from_bytes(payload) {
            Ok(incoming) => incoming,
            Err(err) => {
                debug!("Bad extended handshake from {}: {:?}", self.peer, err);
                return Ok(());
            }
        };
        state.extensions.merge_handshake(incoming);

        if state.extensions.ut_pex_id().is_some() {
            self.context
                .pex
                .register_capable(state.key, Instant::now())
                .map_err(PeerSessionError::PexError)?;
        }
        Ok(())
    }

    /// Surfaces PEX-gossiped endpoints to whatever peer source listens.
    fn handle_pex(&self, payload: &[u8]) {
        let message = match PexMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!("Bad PEX message from {}: {:?}", self.peer, err);
                return;
            }
        };
        for peer in message.added {
            self.context.bus.emit(Event::PeerDiscovered {
                torrent: self.context.torrent.id,
                peer,
            });
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Producer side

    fn producer_pass(
        &mut self,
        stream: &mut TcpStream,
        state: &mut ConnectionState,
    ) -> Result<(), PeerSessionError> {
        let now = Instant::now();

        // Materialize the choker's verdict.
        let should_choke = state.shared().should_choke();
        if should_choke != state.choking {
            if should_choke {
                self.send(stream, Message::Choke)?;
                // The peer's outstanding requests are void now.
                state.queued_uploads.clear();
                state.cancelled.clear();
            } else {
                self.send(stream, Message::Unchoke)?;
            }
            state.choking = should_choke;
            state.last_choked = Some(now);
        }

        // Advertise newly verified pieces, cancel requests made
        // obsolete by verification elsewhere (endgame losers) or by a
        // reclaimed assignment.
        let verified = self
            .context
            .data
            .verified()
            .map_err(PeerSessionError::StorageError)?;
        for index in verified.diff(&state.advertised) {
            self.send(stream, Message::Have { index })?;
        }
        let active = self.lock_assignments()?.active_for_peer(&self.peer);
        let obsolete: Vec<BlockKey> = state
            .pending_requests
            .iter()
            .filter(|key| verified.has_piece(key.index) || !active.contains(&key.index))
            .copied()
            .collect();
        for key in obsolete {
            self.send(
                stream,
                Message::Cancel {
                    index: key.index,
                    begin: key.begin,
                    length: key.length,
                },
            )?;
            state.pending_requests.remove(&key);
        }
        state.advertised = verified.clone();

        // Interest tracking: we want pieces the peer has and we lack.
        let desired = state
            .peer_bitfield
            .iter_set()
            .any(|index| !verified.has_piece(index));
        if desired && !state.interested {
            self.send(stream, Message::Interested)?;
            state.interested = true;
        } else if !desired && state.interested {
            self.send(stream, Message::NotInterested)?;
            state.interested = false;
        }

        if state.interested && !state.peer_choking {
            self.fill_requests(stream, state, &verified, now)?;
        }

        self.emit_completed_blocks(stream, state)?;

        // PEX gossip, if the peer negotiated it.
        if let Some(pex_id) = state.extensions.ut_pex_id() {
            if let Some(message) = self
                .context
                .pex
                .produce(&state.key, now)
                .map_err(PeerSessionError::PexError)?
            {
                self.send(
                    stream,
                    Message::Extended {
                        id: pex_id,
                        payload: message.to_bytes(),
                    },
                )?;
            }
        }

        if self.last_message_sent.elapsed() >= KEEP_ALIVE_INTERVAL {
            self.send(stream, Message::KeepAlive)?;
        }
        Ok(())
    }

    /// Tops the outstanding-request window up from the peer's current
    /// assignment, reserving more pieces while capacity remains.
    fn fill_requests(
        &mut self,
        stream: &mut TcpStream,
        state: &mut ConnectionState,
        verified: &Bitfield,
        now: Instant,
    ) -> Result<(), PeerSessionError> {
        let window = self.context.config.max_pending_requests_per_peer as usize;
        let block_size = self.context.config.block_size;

        loop {
            if state.pending_requests.len() >= window {
                return Ok(());
            }

            let active = self.lock_assignments()?.active_for_peer(&self.peer);
            for piece in &active {
                let piece_size = match self.context.torrent.piece_size(*piece) {
                    Ok(piece_size) => piece_size,
                    Err(_) => continue,
                };
                for begin in self.assembler.missing_blocks(*piece, piece_size) {
                    if state.pending_requests.len() >= window {
                        return Ok(());
                    }
                    let length = block_size.min(piece_size - begin);
                    let key = BlockKey {
                        index: *piece,
                        begin,
                        length,
                    };
                    if state.pending_requests.contains(&key) {
                        continue;
                    }
                    self.send(
                        stream,
                        Message::Request {
                            index: key.index,
                            begin: key.begin,
                            length: key.length,
                        },
                    )?;
                    state.pending_requests.insert(key);
                }
            }

            let next = {
                let stats = self.lock_stats()?;
                let mut assignments = self.lock_assignments()?;
                assignments.next_for_peer(&self.peer, &state.peer_bitfield, &stats, verified, now)
            };
            if next.is_none() {
                return Ok(());
            }
        }
    }

    /// Emits blocks the I/O pool finished reading, dropping the ones
    /// the peer cancelled meanwhile.
    fn emit_completed_blocks(
        &mut self,
        stream: &mut TcpStream,
        state: &mut ConnectionState,
    ) -> Result<(), PeerSessionError> {
        loop {
            let block_read = match self.completed_rx.try_recv() {
                Ok(block_read) => block_read,
                Err(_) => return Ok(()),
            };
            match block_read {
                BlockRead::Ready {
                    index,
                    begin,
                    block,
                } => {
                    let key = BlockKey {
                        index,
                        begin,
                        length: block.len() as u32,
                    };
                    state.queued_uploads.remove(&key);
                    if state.cancelled.remove(&key) {
                        debug!("Block {}:{} cancelled by {}", index, begin, self.peer);
                        continue;
                    }
                    if state.choking {
                        continue;
                    }
                    let length = block.len() as u64;
                    self.send(
                        stream,
                        Message::Piece {
                            index,
                            begin,
                            block,
                        },
                    )?;
                    state.record_uploaded(length);
                    debug!("Sent piece: {} / Offset: {}", index, begin);
                }
                BlockRead::Rejected {
                    index,
                    begin,
                    length,
                } => {
                    state.queued_uploads.remove(&BlockKey {
                        index,
                        begin,
                        length,
                    });
                    debug!("Request {}:{} from {} rejected", index, begin, self.peer);
                }
                BlockRead::Failed {
                    index,
                    begin,
                    length,
                    kind,
                } => {
                    state.queued_uploads.remove(&BlockKey {
                        index,
                        begin,
                        length,
                    });
                    warn!("Read of block {}:{} failed: {:?}", index, begin, kind);
                }
            }
        }
    }

    /// Generic sending function.
    fn send(&mut self, stream: &mut TcpStream, message: Message) -> Result<(), PeerSessionError> {
        stream
            .write_all(&message.to_bytes())
            .map_err(PeerSessionError::ErrorSendingMessage)?;
        self.last_message_sent = Instant::now();
        Ok(())
    }

    fn lock_stats(
        &self,
    ) -> Result<std::sync::MutexGuard<PieceStatistics>, PeerSessionError> {
        self.context
            .stats
            .lock()
            .map_err(|_| PeerSessionError::PoisonedSchedulerLock)
    }

    fn lock_assignments(
        &self,
    ) -> Result<std::sync::MutexGuard<Assignments>, PeerSessionError> {
        self.context
            .assignments
            .lock()
            .map_err(|_| PeerSessionError::PoisonedSchedulerLock)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::torrent::TorrentId;

    const CONFIG_PATH: &str = "config.cfg";
    const PIECE_LEN: u32 = 16384;

    #[test]
    fn test_single_piece_download_over_loopback() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (context, dir) = build_context("session_single_piece", [b'A'; 20]);
        let verified_events = count_events(&context.bus, |event| {
            matches!(event, Event::PieceVerified { .. })
        });

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let torrent_id = context.torrent.id;

        let seeder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            exchange_handshake(&mut stream, torrent_id);
            stream
                .write_all(&Message::Bitfield(vec![0x80]).to_bytes())
                .unwrap();

            wait_for(&mut stream, 2); // INTERESTED
            stream.write_all(&Message::Unchoke.to_bytes()).unwrap();

            let request = wait_for(&mut stream, 6);
            assert_eq!(&request[0..4], &0u32.to_be_bytes());
            assert_eq!(&request[4..8], &0u32.to_be_bytes());
            assert_eq!(&request[8..12], &PIECE_LEN.to_be_bytes());

            stream
                .write_all(
                    &Message::Piece {
                        index: 0,
                        begin: 0,
                        block: vec![b'A'; PIECE_LEN as usize],
                    }
                    .to_bytes(),
                )
                .unwrap();

            // The downloader announces the piece back to the swarm.
            let have = wait_for(&mut stream, 4);
            assert_eq!(&have[0..4], &0u32.to_be_bytes());
        });

        let peer = Peer::new(addr.ip(), addr.port());
        let mut session = PeerSession::new(peer, context.clone());
        let result = session.start_outgoing();

        seeder.join().unwrap();
        result.unwrap();

        assert!(context.data.is_complete().unwrap());
        assert_eq!(verified_events.load(Ordering::SeqCst), 1);
        // The session tore its registrations down on the way out.
        assert_eq!(context.pool.count(&torrent_id).unwrap(), 0);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_hash_mismatch_blames_and_rerequests() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (context, dir) = build_context("session_hash_mismatch", [b'A'; 20]);
        let verified_events = count_events(&context.bus, |event| {
            matches!(event, Event::PieceVerified { .. })
        });

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let torrent_id = context.torrent.id;

        let seeder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            exchange_handshake(&mut stream, torrent_id);
            stream
                .write_all(&Message::Bitfield(vec![0x80]).to_bytes())
                .unwrap();

            wait_for(&mut stream, 2);
            stream.write_all(&Message::Unchoke.to_bytes()).unwrap();

            wait_for(&mut stream, 6);
            // Wrong payload: the digest table says 'A's.
            stream
                .write_all(
                    &Message::Piece {
                        index: 0,
                        begin: 0,
                        block: vec![b'B'; PIECE_LEN as usize],
                    }
                    .to_bytes(),
                )
                .unwrap();

            // The piece returns to the pool and gets re-requested.
            let request = wait_for(&mut stream, 6);
            assert_eq!(&request[0..4], &0u32.to_be_bytes());
        });

        let peer = Peer::new(addr.ip(), addr.port());
        let mut session = PeerSession::new(peer, context.clone());
        let result = session.start_outgoing();

        seeder.join().unwrap();
        result.unwrap();

        assert!(!context.data.verified().unwrap().has_piece(0));
        assert_eq!(verified_events.load(Ordering::SeqCst), 0);
        assert_eq!(
            context.assignments.lock().unwrap().failures(&peer),
            1,
            "the sending peer is attributed the bad piece"
        );

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_choke_tick_prefers_the_downloading_peer() {
        let (context, dir) = build_context("session_choke_tick", [b'A'; 20]);
        let torrent_id = context.torrent.id;

        let busy = ConnectionKey::new(torrent_id, build_peer(1));
        let idle = ConnectionKey::new(torrent_id, build_peer(2));
        let busy_shared = context.pool.add(busy).unwrap();
        let idle_shared = context.pool.add(idle).unwrap();
        busy_shared.set_peer_interested(true);
        idle_shared.set_peer_interested(true);

        // Establish the baseline, then let one peer move bytes.
        context.choke_tick().unwrap();
        busy_shared.add_downloaded(50_000);

        context.choke_tick().unwrap();

        assert!(!busy_shared.should_choke());
        // Two peers, four slots: both fit.
        assert!(!idle_shared.should_choke());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_stop_requests_session_close() {
        let (context, dir) = build_context("session_stop", [b'A'; 20]);
        let key = ConnectionKey::new(context.torrent.id, build_peer(1));
        let shared = context.pool.add(key).unwrap();

        context.stop();

        assert!(context.is_stopped());
        assert!(shared.close_requested());

        fs::remove_dir_all(dir).unwrap();
    }

    // Auxiliary functions

    fn build_context(name: &str, id: [u8; 20]) -> (Arc<SessionContext>, PathBuf) {
        let dir = PathBuf::from("./download").join(format!("test_{}", name));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }

        let torrent = Torrent::new(
            TorrentId::new(id),
            "example".to_string(),
            PIECE_LEN,
            vec![(PathBuf::from("example.bin"), PIECE_LEN as u64)],
            Sha1::digest(vec![b'A'; PIECE_LEN as usize]).to_vec(),
        )
        .unwrap();

        let config = Cfg::new(CONFIG_PATH).unwrap();
        let data =
            Arc::new(DataDescriptor::open(torrent.clone(), dir.to_str().unwrap()).unwrap());
        let bus = Arc::new(EventBus::new());
        let io = Arc::new(IoPool::new(1));

        let context = SessionContext::new(torrent, data, config, bus, io, *b"-BC0001-000000000001");
        (context, dir)
    }

    fn build_peer(index: u8) -> Peer {
        Peer::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, index)),
            6881,
        )
    }

    fn count_events<F>(bus: &Arc<EventBus>, filter: F) -> Arc<AtomicUsize>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            bus.subscribe(move |event| {
                if filter(event) {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        count
    }

    fn exchange_handshake(stream: &mut TcpStream, torrent_id: TorrentId) {
        let mut buffer = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buffer).unwrap();
        let handshake = Handshake::from_bytes(&buffer).unwrap();
        assert_eq!(handshake.info_hash, torrent_id);

        stream
            .write_all(&Handshake::new(torrent_id, *b"-RM0001-999999999999").to_bytes())
            .unwrap();
    }

    /// Reads frames until one with the wanted id arrives, returning
    /// its payload. Skips keep-alives and unrelated messages.
    fn wait_for(stream: &mut TcpStream, wanted: u8) -> Vec<u8> {
        loop {
            let mut length = [0u8; 4];
            stream.read_exact(&mut length).unwrap();
            let length = u32::from_be_bytes(length) as usize;
            if length == 0 {
                continue;
            }
            let mut frame = vec![0u8; length];
            stream.read_exact(&mut frame).unwrap();
            if frame[0] == wanted {
                return frame[1..].to_vec();
            }
        }
    }
}
