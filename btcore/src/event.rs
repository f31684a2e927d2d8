use std::sync::Mutex;

use tracing::warn;

use crate::peer::peer::Peer;
use crate::torrent::TorrentId;

/// Domain events fanned out to registered listeners.
///
/// One tagged union instead of an event hierarchy; every variant
/// carries the torrent it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A peer endpoint surfaced (e.g. from PEX gossip); peer sources
    /// subscribe to feed their candidate pools.
    PeerDiscovered { torrent: TorrentId, peer: Peer },
    PeerConnected { torrent: TorrentId, peer: Peer },
    PeerDisconnected { torrent: TorrentId, peer: Peer },
    PieceVerified { torrent: TorrentId, piece: u32 },
    DownloadComplete { torrent: TorrentId },
    TorrentStopped { torrent: TorrentId },
}

impl Event {
    pub fn torrent(&self) -> TorrentId {
        match self {
            Event::PeerDiscovered { torrent, .. }
            | Event::PeerConnected { torrent, .. }
            | Event::PeerDisconnected { torrent, .. }
            | Event::PieceVerified { torrent, .. }
            | Event::DownloadComplete { torrent }
            | Event::TorrentStopped { torrent } => *torrent,
        }
    }
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Synchronous listener fan-out.
///
/// Listeners run in registration order on the emitting thread, so an
/// emit after a state change happens-before every listener observing
/// it (piece verification before `PieceVerified` delivery relies on
/// this).
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(Box::new(listener)),
            Err(_) => warn!("Event bus listener list poisoned; listener dropped"),
        }
    }

    pub fn emit(&self, event: Event) {
        match self.listeners.lock() {
            Ok(listeners) => {
                for listener in listeners.iter() {
                    listener(&event);
                }
            }
            Err(_) => warn!("Event bus listener list poisoned; event dropped"),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        bus.emit(Event::DownloadComplete {
            torrent: TorrentId::new([1; 20]),
        });

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_every_listener_sees_every_event() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let torrent = TorrentId::new([1; 20]);
        let peer = Peer::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        bus.emit(Event::PeerConnected { torrent, peer });
        bus.emit(Event::PeerDisconnected { torrent, peer });

        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_event_torrent_accessor() {
        let torrent = TorrentId::new([2; 20]);
        let event = Event::PieceVerified { torrent, piece: 3 };
        assert_eq!(event.torrent(), torrent);
    }
}
