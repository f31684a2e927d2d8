use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::cfg::Cfg;
use crate::peer::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
use crate::peer::peer::Peer;
use crate::peer::pool::ConnectionPoolError;
use crate::peer::session::{PeerSession, SessionContext};
use crate::registry::{RegistryError, TorrentRegistry};
use crate::torrent::TorrentId;

/// Posible acceptor errors.
#[derive(Debug)]
pub enum BtAcceptorError {
    OpeningListenerError(io::Error),
    HandleConnectionError(io::Error),
    ErrorSettingStreamTimeout,
    InvalidHandshake(HandshakeError),
    UnknownTorrent(TorrentId),
    TorrentNotActive(TorrentId),
    MaxPeersConnectedReached(TorrentId),
    RegistryError(RegistryError),
    PoolError(ConnectionPoolError),
}

/// Listens for incoming peer connections and hands them to per-peer
/// session threads.
///
/// An incoming handshake is routed by its info hash: the torrent must
/// be registered and active, and below its connection cap.
pub struct BtAcceptor {
    config: Cfg,
    registry: Arc<TorrentRegistry>,
    contexts: HashMap<TorrentId, Arc<SessionContext>>,
}

impl BtAcceptor {
    pub fn new(
        contexts: HashMap<TorrentId, Arc<SessionContext>>,
        registry: Arc<TorrentRegistry>,
        config: Cfg,
    ) -> Self {
        Self {
            config,
            registry,
            contexts,
        }
    }

    /// Starts the server and starts listening for connections.
    ///
    /// # Errors
    /// - `OpeningListenerError` if the TcpListener couldn't be opened.
    pub fn init(&self) -> Result<(), BtAcceptorError> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.config.tcp_port))
            .map_err(BtAcceptorError::OpeningListenerError)?;

        info!(
            "Acceptor listening for connections on port {}",
            self.config.tcp_port
        );

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => match self.handle_connection(stream) {
                    Ok(_) => (),
                    Err(err) => warn!("Couldn't handle incoming connection: {:?}", err),
                },
                Err(err) => warn!("Couldn't handle incoming connection: {:?}", err),
            }
        }

        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<(), BtAcceptorError> {
        let addr = stream
            .peer_addr()
            .map_err(BtAcceptorError::HandleConnectionError)?;

        stream
            .set_read_timeout(Some(Duration::from_secs(
                self.config.read_write_seconds_timeout,
            )))
            .map_err(|_| BtAcceptorError::ErrorSettingStreamTimeout)?;

        let mut buffer = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buffer)
            .map_err(BtAcceptorError::HandleConnectionError)?;
        let handshake =
            Handshake::from_bytes(&buffer).map_err(BtAcceptorError::InvalidHandshake)?;

        let torrent_id = handshake.info_hash;
        let supported = self
            .registry
            .is_supported_and_active(&torrent_id)
            .map_err(BtAcceptorError::RegistryError)?;
        if !supported {
            return Err(BtAcceptorError::TorrentNotActive(torrent_id));
        }

        let context = self
            .contexts
            .get(&torrent_id)
            .ok_or(BtAcceptorError::UnknownTorrent(torrent_id))?
            .clone();

        let current = context
            .pool
            .count(&torrent_id)
            .map_err(BtAcceptorError::PoolError)?;
        if current >= self.config.max_peers_per_torrent as usize {
            return Err(BtAcceptorError::MaxPeersConnectedReached(torrent_id));
        }

        let peer = Peer::new(addr.ip(), addr.port());
        let name = format!("Torrent: {} / Peer: {}", context.torrent.name(), peer);
        let builder = thread::Builder::new().name(name);

        let spawned = builder.spawn(move || {
            let mut session = PeerSession::new(peer, context);
            if let Err(err) = session.start_incoming(stream, handshake) {
                warn!("{:?}", err);
            }
        });
        if let Err(err) = spawned {
            warn!("Couldn't spawn session thread: {}", err);
        }
        Ok(())
    }
}
