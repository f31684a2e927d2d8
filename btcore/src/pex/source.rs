use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::cfg::Cfg;
use crate::peer::connection::ConnectionKey;
use crate::peer::peer::Peer;
use crate::torrent::TorrentId;

use super::event::{PeerEvent, PeerEventKind};
use super::message::PexMessage;

/// How often `cleanup` is scheduled by the timer thread.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(37);

/// A connection that has not been sent anything for this long stops
/// pinning the event queues.
const LAST_SENT_RETENTION: Duration = Duration::from_secs(600);

/// Posible PEX source errors.
#[derive(Debug, PartialEq)]
pub enum PexSourceError {
    PoisonedQueuesLock,
    PoisonedCapableLock,
    PoisonedLastSentLock,
}

/// Per-torrent gossip of swarm membership changes.
///
/// Connect/disconnect events append to an instant-ordered queue per
/// torrent; PEX-capable connections each keep a watermark
/// (`last_sent`) and receive the events past it, rate- and
/// size-limited. Cleanup trims the front of every queue up to the
/// least-advanced watermark.
#[derive(Debug)]
pub struct PexSource {
    min_message_interval: Duration,
    max_message_interval: Duration,
    min_events_per_message: usize,
    max_events_per_message: usize,
    queues: RwLock<HashMap<TorrentId, VecDeque<PeerEvent>>>,
    capable: Mutex<HashSet<ConnectionKey>>,
    last_sent: Mutex<HashMap<ConnectionKey, Instant>>,
}

impl PexSource {
    pub fn new(config: &Cfg) -> Self {
        Self {
            min_message_interval: Duration::from_secs(config.pex_min_message_interval_seconds),
            max_message_interval: Duration::from_secs(config.pex_max_message_interval_seconds),
            min_events_per_message: config.pex_min_events_per_message,
            max_events_per_message: config.pex_max_events_per_message,
            queues: RwLock::new(HashMap::new()),
            capable: Mutex::new(HashSet::new()),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Records a peer joining the torrent's swarm.
    pub fn peer_added(
        &self,
        torrent: TorrentId,
        peer: Peer,
        now: Instant,
    ) -> Result<(), PexSourceError> {
        self.push_event(torrent, PeerEvent::added(peer, now))
    }

    /// Records a peer leaving the torrent's swarm.
    pub fn peer_dropped(
        &self,
        torrent: TorrentId,
        peer: Peer,
        now: Instant,
    ) -> Result<(), PexSourceError> {
        self.push_event(torrent, PeerEvent::dropped(peer, now))
    }

    fn push_event(&self, torrent: TorrentId, event: PeerEvent) -> Result<(), PexSourceError> {
        let mut queues = self
            .queues
            .write()
            .map_err(|_| PexSourceError::PoisonedQueuesLock)?;
        queues.entry(torrent).or_default().push_back(event);
        Ok(())
    }

    /// Marks a connection as `ut_pex`-capable. Its watermark starts
    /// now: only events after this moment reach it.
    pub fn register_capable(
        &self,
        key: ConnectionKey,
        now: Instant,
    ) -> Result<(), PexSourceError> {
        self.capable
            .lock()
            .map_err(|_| PexSourceError::PoisonedCapableLock)?
            .insert(key);
        self.last_sent
            .lock()
            .map_err(|_| PexSourceError::PoisonedLastSentLock)?
            .insert(key, now);
        Ok(())
    }

    /// Forgets a closed connection.
    pub fn unregister(&self, key: &ConnectionKey) -> Result<(), PexSourceError> {
        self.capable
            .lock()
            .map_err(|_| PexSourceError::PoisonedCapableLock)?
            .remove(key);
        self.last_sent
            .lock()
            .map_err(|_| PexSourceError::PoisonedLastSentLock)?
            .remove(key);
        Ok(())
    }

    /// Builds the next PEX message for a connection, or `None` when
    /// rate limits or event thresholds hold it back.
    ///
    /// Events about the connection's own peer are never included.
    pub fn produce(
        &self,
        key: &ConnectionKey,
        now: Instant,
    ) -> Result<Option<PexMessage>, PexSourceError> {
        let is_capable = self
            .capable
            .lock()
            .map_err(|_| PexSourceError::PoisonedCapableLock)?
            .contains(key);
        if !is_capable {
            return Ok(None);
        }

        let last = {
            let last_sent = self
                .last_sent
                .lock()
                .map_err(|_| PexSourceError::PoisonedLastSentLock)?;
            match last_sent.get(key) {
                Some(last) => *last,
                None => return Ok(None),
            }
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.min_message_interval {
            return Ok(None);
        }

        let events = {
            let queues = self
                .queues
                .read()
                .map_err(|_| PexSourceError::PoisonedQueuesLock)?;
            let queue = match queues.get(&key.torrent) {
                Some(queue) => queue,
                None => return Ok(None),
            };
            queue
                .iter()
                .filter(|event| event.instant >= last)
                .filter(|event| !event.peer.is_same_endpoint(&key.peer))
                .take(self.max_events_per_message)
                .copied()
                .collect::<Vec<PeerEvent>>()
        };

        let due = events.len() >= self.min_events_per_message
            || (!events.is_empty() && elapsed >= self.max_message_interval);
        if !due {
            return Ok(None);
        }

        let mut added = Vec::new();
        let mut dropped = Vec::new();
        for event in events {
            match event.kind {
                PeerEventKind::Added => added.push(event.peer),
                PeerEventKind::Dropped => dropped.push(event.peer),
            }
        }

        self.last_sent
            .lock()
            .map_err(|_| PexSourceError::PoisonedLastSentLock)?
            .insert(*key, now);

        debug!(
            "PEX for {}: {} added, {} dropped",
            key.peer,
            added.len(),
            dropped.len()
        );
        Ok(Some(PexMessage::new(added, dropped)))
    }

    /// Trims queues up to the least-advanced watermark and evicts
    /// watermarks idle past the retention cap.
    ///
    /// The trim uses `instant <= lru`, so an event stamped exactly at a
    /// watermark that was just sent can be dropped for a subscriber
    /// that still wanted it. Known race, kept as-is.
    pub fn cleanup(&self, now: Instant) -> Result<(), PexSourceError> {
        let lru = {
            let mut last_sent = self
                .last_sent
                .lock()
                .map_err(|_| PexSourceError::PoisonedLastSentLock)?;
            last_sent
                .retain(|_, sent| now.saturating_duration_since(*sent) <= LAST_SENT_RETENTION);
            last_sent.values().min().copied()
        };

        let mut queues = self
            .queues
            .write()
            .map_err(|_| PexSourceError::PoisonedQueuesLock)?;
        match lru {
            Some(lru) => {
                for queue in queues.values_mut() {
                    while queue.front().map(|e| e.instant <= lru).unwrap_or(false) {
                        queue.pop_front();
                    }
                }
            }
            None => {
                // Nobody subscribed: no watermark can ever reach back here.
                queues.clear();
            }
        }
        Ok(())
    }

    /// Drops a stopped torrent's queue.
    pub fn drain_torrent(&self, torrent: &TorrentId) -> Result<(), PexSourceError> {
        self.queues
            .write()
            .map_err(|_| PexSourceError::PoisonedQueuesLock)?
            .remove(torrent);
        Ok(())
    }

    #[cfg(test)]
    fn queued_events(&self, torrent: &TorrentId) -> usize {
        self.queues
            .read()
            .map(|queues| queues.get(torrent).map(|q| q.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    const CONFIG_PATH: &str = "config.cfg";

    #[test]
    fn test_rate_limit_holds_then_releases() {
        // min=60s, max=120s, min_events=1 per the checked-in config.
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let a = build_peer(1);
        let b = build_peer(2);
        let key = ConnectionKey::new(torrent, a);
        source.register_capable(key, t0).unwrap();

        source
            .peer_added(torrent, b, t0 + Duration::from_secs(1))
            .unwrap();

        // 30 s in: the minimum interval has not elapsed.
        let early = source.produce(&key, t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(early, None);

        // 61 s in: one added peer goes out.
        let message = source
            .produce(&key, t0 + Duration::from_secs(61))
            .unwrap()
            .unwrap();
        assert_eq!(message.added, vec![b]);
        assert!(message.dropped.is_empty());

        // The watermark moved: nothing new within the next interval.
        let again = source.produce(&key, t0 + Duration::from_secs(62)).unwrap();
        assert_eq!(again, None);
    }

    #[test]
    fn test_own_peer_is_excluded() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let x = build_peer(7);
        let key = ConnectionKey::new(torrent, x);
        source.register_capable(key, t0).unwrap();
        source
            .peer_added(torrent, x, t0 + Duration::from_secs(1))
            .unwrap();

        let message = source.produce(&key, t0 + Duration::from_secs(61)).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_non_capable_connection_gets_nothing() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let key = ConnectionKey::new(torrent, build_peer(1));
        source
            .peer_added(torrent, build_peer(2), t0)
            .unwrap();

        let message = source.produce(&key, t0 + Duration::from_secs(61)).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_events_before_registration_are_not_replayed() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        source.peer_added(torrent, build_peer(2), t0).unwrap();

        let key = ConnectionKey::new(torrent, build_peer(1));
        source
            .register_capable(key, t0 + Duration::from_secs(5))
            .unwrap();

        let message = source.produce(&key, t0 + Duration::from_secs(70)).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_max_events_per_message_caps_the_batch() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let key = ConnectionKey::new(torrent, build_peer(1));
        source.register_capable(key, t0).unwrap();

        // 60 joined peers; the config caps a message at 50.
        for index in 0..60u16 {
            let peer = Peer::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, (index % 250) as u8 + 1)),
                7000 + index,
            );
            source
                .peer_added(torrent, peer, t0 + Duration::from_secs(1))
                .unwrap();
        }

        let message = source
            .produce(&key, t0 + Duration::from_secs(61))
            .unwrap()
            .unwrap();
        assert_eq!(message.added.len(), 50);
    }

    #[test]
    fn test_dropped_events_land_in_the_dropped_list() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let key = ConnectionKey::new(torrent, build_peer(1));
        source.register_capable(key, t0).unwrap();
        source
            .peer_added(torrent, build_peer(2), t0 + Duration::from_secs(1))
            .unwrap();
        source
            .peer_dropped(torrent, build_peer(3), t0 + Duration::from_secs(2))
            .unwrap();

        let message = source
            .produce(&key, t0 + Duration::from_secs(61))
            .unwrap()
            .unwrap();
        assert_eq!(message.added, vec![build_peer(2)]);
        assert_eq!(message.dropped, vec![build_peer(3)]);
    }

    #[test]
    fn test_cleanup_trims_up_to_the_lru_watermark() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let fast = ConnectionKey::new(torrent, build_peer(1));
        let slow = ConnectionKey::new(torrent, build_peer(2));
        source.register_capable(fast, t0).unwrap();
        source.register_capable(slow, t0).unwrap();

        source
            .peer_added(torrent, build_peer(3), t0 + Duration::from_secs(1))
            .unwrap();
        source
            .peer_added(torrent, build_peer(4), t0 + Duration::from_secs(90))
            .unwrap();

        // Only the fast connection consumed; its watermark is t0+100.
        source
            .produce(&fast, t0 + Duration::from_secs(100))
            .unwrap()
            .unwrap();

        // The slow connection's watermark (t0) floors the trim: both
        // events survive for it.
        source.cleanup(t0 + Duration::from_secs(101)).unwrap();
        assert_eq!(source.queued_events(&torrent), 2);

        // Slow consumes; now its watermark advances and cleanup trims.
        source
            .produce(&slow, t0 + Duration::from_secs(102))
            .unwrap()
            .unwrap();
        source.cleanup(t0 + Duration::from_secs(103)).unwrap();
        assert_eq!(source.queued_events(&torrent), 0);
    }

    #[test]
    fn test_cleanup_without_subscribers_clears_queues() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        source.peer_added(torrent, build_peer(2), t0).unwrap();
        source.cleanup(t0 + Duration::from_secs(1)).unwrap();

        assert_eq!(source.queued_events(&torrent), 0);
    }

    #[test]
    fn test_unregister_forgets_the_watermark() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        let key = ConnectionKey::new(torrent, build_peer(1));
        source.register_capable(key, t0).unwrap();
        source.unregister(&key).unwrap();

        source
            .peer_added(torrent, build_peer(2), t0 + Duration::from_secs(1))
            .unwrap();
        let message = source.produce(&key, t0 + Duration::from_secs(61)).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_drain_torrent_empties_its_queue() {
        let source = build_source();
        let torrent = TorrentId::new([1; 20]);
        let t0 = Instant::now();

        source.peer_added(torrent, build_peer(2), t0).unwrap();
        source.drain_torrent(&torrent).unwrap();

        assert_eq!(source.queued_events(&torrent), 0);
    }

    // Auxiliary functions

    fn build_source() -> PexSource {
        let config = Cfg::new(CONFIG_PATH).unwrap();
        PexSource::new(&config)
    }

    fn build_peer(index: u8) -> Peer {
        Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, index)), 6881)
    }
}
