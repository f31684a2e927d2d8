use rand::seq::SliceRandom;
use tracing::debug;

use crate::peer::peer::Peer;

/// Default number of regular unchoke slots.
pub const REGULAR_UNCHOKE_SLOTS: usize = 4;

/// Throughput snapshot of one connection, taken at tick time.
///
/// `delta_bytes` is bytes downloaded from the peer since the previous
/// tick while leeching, bytes uploaded to it while seeding.
#[derive(Debug, Clone)]
pub struct PeerThroughput {
    pub peer: Peer,
    pub interested: bool,
    pub currently_choked: bool,
    pub delta_bytes: u64,
}

/// One peer's new choke flag after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peer: Peer,
    pub should_choke: bool,
}

/// Periodic tit-for-tat unchoke selection.
///
/// Every tick the top throughput peers among the interested get the
/// regular slots; every `optimistic_every`th tick one additional
/// interested choked peer is unchoked at random so newcomers can prove
/// themselves. The choker only computes flags; sessions materialize
/// CHOKE/UNCHOKE on their next producer pass.
#[derive(Debug)]
pub struct Choker {
    regular_slots: usize,
    optimistic_every: u32,
    tick: u32,
}

impl Choker {
    pub fn new(optimistic_every: u32) -> Self {
        Self {
            regular_slots: REGULAR_UNCHOKE_SLOTS,
            optimistic_every,
            tick: 0,
        }
    }

    /// Runs one tick over the connection snapshots and returns a
    /// decision for every peer in the input.
    pub fn run_tick(&mut self, mut peers: Vec<PeerThroughput>) -> Vec<ChokeDecision> {
        self.tick = self.tick.wrapping_add(1);

        let mut unchoked: Vec<Peer> = Vec::with_capacity(self.regular_slots + 1);

        // Regular slots: best recent throughput among the interested.
        peers.sort_by(|a, b| b.delta_bytes.cmp(&a.delta_bytes));
        for snapshot in peers.iter().filter(|snapshot| snapshot.interested) {
            if unchoked.len() >= self.regular_slots {
                break;
            }
            unchoked.push(snapshot.peer);
        }

        if self.optimistic_every > 0 && self.tick % self.optimistic_every == 0 {
            let candidates: Vec<Peer> = peers
                .iter()
                .filter(|snapshot| {
                    snapshot.interested
                        && snapshot.currently_choked
                        && !unchoked.contains(&snapshot.peer)
                })
                .map(|snapshot| snapshot.peer)
                .collect();
            if let Some(lucky) = candidates.choose(&mut rand::thread_rng()) {
                debug!("Optimistic unchoke of {}", lucky);
                unchoked.push(*lucky);
            }
        }

        peers
            .iter()
            .map(|snapshot| ChokeDecision {
                peer: snapshot.peer,
                should_choke: !unchoked.contains(&snapshot.peer),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn test_top_throughput_peers_get_the_slots() {
        let mut choker = Choker::new(3);
        let peers: Vec<PeerThroughput> = (0..6)
            .map(|index| build_snapshot(index, true, true, index as u64 * 100))
            .collect();

        let decisions = choker.run_tick(peers);

        let unchoked: HashSet<Peer> = decisions
            .iter()
            .filter(|decision| !decision.should_choke)
            .map(|decision| decision.peer)
            .collect();
        let expected: HashSet<Peer> = (2..6).map(|index| build_peer(index)).collect();
        assert_eq!(unchoked, expected);
    }

    #[test]
    fn test_uninterested_peers_never_take_slots() {
        let mut choker = Choker::new(3);
        let peers = vec![
            build_snapshot(0, false, true, 10_000),
            build_snapshot(1, true, true, 10),
        ];

        let decisions = choker.run_tick(peers);

        for decision in decisions {
            if decision.peer == build_peer(0) {
                assert!(decision.should_choke);
            } else {
                assert!(!decision.should_choke);
            }
        }
    }

    #[test]
    fn test_optimistic_unchoke_on_the_configured_tick() {
        let mut choker = Choker::new(3);

        // Five fast interested peers hold the four regular slots; the
        // slow choked one can only get in optimistically.
        let build_input = || {
            let mut peers: Vec<PeerThroughput> = (0..4)
                .map(|index| build_snapshot(index, true, false, 1000))
                .collect();
            peers.push(build_snapshot(9, true, true, 0));
            peers
        };

        for tick in 1..=6 {
            let decisions = choker.run_tick(build_input());
            let slow_unchoked = decisions
                .iter()
                .any(|decision| decision.peer == build_peer(9) && !decision.should_choke);
            if tick % 3 == 0 {
                assert!(slow_unchoked, "tick {} should unchoke optimistically", tick);
            } else {
                assert!(!slow_unchoked, "tick {} unchoked unexpectedly", tick);
            }
        }
    }

    #[test]
    fn test_every_input_peer_gets_a_decision() {
        let mut choker = Choker::new(3);
        let peers: Vec<PeerThroughput> = (0..10)
            .map(|index| build_snapshot(index, index % 2 == 0, true, 0))
            .collect();

        let decisions = choker.run_tick(peers);
        assert_eq!(decisions.len(), 10);
    }

    // Auxiliary functions

    fn build_peer(index: u8) -> Peer {
        Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, index)), 6881)
    }

    fn build_snapshot(
        index: u8,
        interested: bool,
        currently_choked: bool,
        delta_bytes: u64,
    ) -> PeerThroughput {
        PeerThroughput {
            peer: build_peer(index),
            interested,
            currently_choked,
            delta_bytes,
        }
    }
}
