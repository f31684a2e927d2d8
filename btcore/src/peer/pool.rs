use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::event::{Event, EventBus};
use crate::peer::connection::{ConnectionKey, SharedConnectionStats};
use crate::torrent::TorrentId;

/// Posible connection pool errors.
#[derive(Debug)]
pub enum ConnectionPoolError {
    PoisonedConnectionsLock,
    LimitReached(TorrentId),
    AlreadyConnected(ConnectionKey),
}

/// Tracks the live connections of every torrent.
///
/// Sessions register on handshake completion and deregister on exit;
/// the pool emits the swarm-membership events the PEX source and peer
/// sources listen for, and hands the choker its per-connection
/// snapshot handles.
#[derive(Debug)]
pub struct ConnectionPool {
    max_peers_per_torrent: usize,
    connections: Mutex<HashMap<ConnectionKey, Arc<SharedConnectionStats>>>,
    bus: Arc<EventBus>,
}

impl ConnectionPool {
    pub fn new(max_peers_per_torrent: usize, bus: Arc<EventBus>) -> Self {
        Self {
            max_peers_per_torrent,
            connections: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Registers a connection and returns its shared stats handle.
    ///
    /// # Errors
    /// - `LimitReached` when the torrent is at its connection cap.
    /// - `AlreadyConnected` for a duplicate endpoint.
    pub fn add(
        &self,
        key: ConnectionKey,
    ) -> Result<Arc<SharedConnectionStats>, ConnectionPoolError> {
        let shared = {
            let mut connections = self.lock_connections()?;
            if connections.contains_key(&key) {
                return Err(ConnectionPoolError::AlreadyConnected(key));
            }
            let torrent_count = connections
                .keys()
                .filter(|existing| existing.torrent == key.torrent)
                .count();
            if torrent_count >= self.max_peers_per_torrent {
                return Err(ConnectionPoolError::LimitReached(key.torrent));
            }

            let shared = Arc::new(SharedConnectionStats::new());
            connections.insert(key, shared.clone());
            shared
        };

        debug!("Connection {} registered", key.peer);
        self.bus.emit(Event::PeerConnected {
            torrent: key.torrent,
            peer: key.peer,
        });
        Ok(shared)
    }

    /// Deregisters a connection; unknown keys are a no-op.
    pub fn remove(&self, key: &ConnectionKey) -> Result<(), ConnectionPoolError> {
        let removed = self.lock_connections()?.remove(key);
        if removed.is_some() {
            debug!("Connection {} removed", key.peer);
            self.bus.emit(Event::PeerDisconnected {
                torrent: key.torrent,
                peer: key.peer,
            });
        }
        Ok(())
    }

    pub fn count(&self, torrent: &TorrentId) -> Result<usize, ConnectionPoolError> {
        Ok(self
            .lock_connections()?
            .keys()
            .filter(|key| key.torrent == *torrent)
            .count())
    }

    /// Stats handles of one torrent's connections, for the choker.
    pub fn snapshot(
        &self,
        torrent: &TorrentId,
    ) -> Result<Vec<(ConnectionKey, Arc<SharedConnectionStats>)>, ConnectionPoolError> {
        Ok(self
            .lock_connections()?
            .iter()
            .filter(|(key, _)| key.torrent == *torrent)
            .map(|(key, shared)| (*key, shared.clone()))
            .collect())
    }

    /// Asks every connection of a torrent to close. Sessions observe
    /// the flag and exit on their next pass.
    pub fn close_torrent(&self, torrent: &TorrentId) -> Result<(), ConnectionPoolError> {
        for (_, shared) in self
            .lock_connections()?
            .iter()
            .filter(|(key, _)| key.torrent == *torrent)
        {
            shared.request_close();
        }
        Ok(())
    }

    fn lock_connections(
        &self,
    ) -> Result<MutexGuard<HashMap<ConnectionKey, Arc<SharedConnectionStats>>>, ConnectionPoolError>
    {
        self.connections
            .lock()
            .map_err(|_| ConnectionPoolError::PoisonedConnectionsLock)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::peer::peer::Peer;

    #[test]
    fn test_add_and_remove_emit_membership_events() {
        let bus = Arc::new(EventBus::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        {
            let connects = connects.clone();
            let disconnects = disconnects.clone();
            bus.subscribe(move |event| match event {
                Event::PeerConnected { .. } => {
                    connects.fetch_add(1, Ordering::SeqCst);
                }
                Event::PeerDisconnected { .. } => {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            });
        }

        let pool = ConnectionPool::new(10, bus);
        let key = build_key(1, 1);

        pool.add(key).unwrap();
        pool.remove(&key).unwrap();
        // Unknown key: no event.
        pool.remove(&key).unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_connection_is_rejected() {
        let pool = build_pool(10);
        let key = build_key(1, 1);

        pool.add(key).unwrap();
        assert!(matches!(
            pool.add(key),
            Err(ConnectionPoolError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_per_torrent_limit() {
        let pool = build_pool(2);

        pool.add(build_key(1, 1)).unwrap();
        pool.add(build_key(1, 2)).unwrap();
        assert!(matches!(
            pool.add(build_key(1, 3)),
            Err(ConnectionPoolError::LimitReached(_))
        ));

        // Another torrent has its own cap.
        pool.add(build_key(2, 1)).unwrap();
        assert_eq!(pool.count(&TorrentId::new([2; 20])).unwrap(), 1);
    }

    #[test]
    fn test_close_torrent_flags_only_its_connections() {
        let pool = build_pool(10);
        let mine = build_key(1, 1);
        let other = build_key(2, 1);

        let mine_shared = pool.add(mine).unwrap();
        let other_shared = pool.add(other).unwrap();

        pool.close_torrent(&mine.torrent).unwrap();

        assert!(mine_shared.close_requested());
        assert!(!other_shared.close_requested());
    }

    // Auxiliary functions

    fn build_pool(limit: usize) -> ConnectionPool {
        ConnectionPool::new(limit, Arc::new(EventBus::new()))
    }

    fn build_key(torrent: u8, peer: u8) -> ConnectionKey {
        ConnectionKey::new(
            TorrentId::new([torrent; 20]),
            Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, peer)), 6881),
        )
    }
}
