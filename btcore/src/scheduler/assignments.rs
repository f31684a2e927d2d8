use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bitfield::Bitfield;
use crate::config::cfg::Cfg;
use crate::peer::peer::Peer;

use super::selector::PieceSelector;
use super::stats::PieceStatistics;

/// One piece reserved for one peer, with a delivery deadline.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub peer: Peer,
    pub piece: u32,
    pub deadline: Instant,
}

/// The torrent-global map of which peer is working on which pieces.
///
/// Outside endgame a piece has at most one owner. Assignments are
/// dropped when the piece verifies, the peer disconnects or the
/// deadline passes; the two failure paths blame the peer.
#[derive(Debug)]
pub struct Assignments {
    selector: PieceSelector,
    max_pieces_per_peer: usize,
    deadline: Duration,
    endgame_threshold: u32,
    owners: HashMap<u32, Vec<Assignment>>,
    per_peer: HashMap<Peer, Vec<u32>>,
    failures: HashMap<Peer, u32>,
}

impl Assignments {
    pub fn new(selector: PieceSelector, config: &Cfg) -> Self {
        Self {
            selector,
            max_pieces_per_peer: config.max_pieces_per_peer,
            deadline: Duration::from_secs(config.assignment_deadline_seconds),
            endgame_threshold: config.endgame_threshold,
            owners: HashMap::new(),
            per_peer: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Whether few enough unverified pieces remain that outstanding
    /// blocks get duplicated across peers.
    pub fn is_endgame(&self, have: &Bitfield) -> bool {
        let remaining = have.piece_count() - have.count_set();
        (remaining as u32) < self.endgame_threshold
    }

    /// Reserves the next piece for a peer, or `None` when the peer has
    /// a full working set or advertises nothing we still need.
    ///
    /// The caller only asks while the peer is unchoking us.
    pub fn next_for_peer(
        &mut self,
        peer: &Peer,
        peer_bitfield: &Bitfield,
        stats: &PieceStatistics,
        have: &Bitfield,
        now: Instant,
    ) -> Option<u32> {
        let active = self.per_peer.get(peer).map(|pieces| pieces.len()).unwrap_or(0);
        if active >= self.max_pieces_per_peer {
            return None;
        }

        let endgame = self.is_endgame(have);
        for piece in self.selector.order(stats, have) {
            if !peer_bitfield.has_piece(piece) {
                continue;
            }
            let owners = self.owners.get(&piece);
            let already_mine = owners
                .map(|owners| owners.iter().any(|a| a.peer == *peer))
                .unwrap_or(false);
            if already_mine {
                continue;
            }
            // One owner per piece until endgame relaxes it.
            if !endgame && owners.map(|owners| !owners.is_empty()).unwrap_or(false) {
                continue;
            }

            let assignment = Assignment {
                peer: *peer,
                piece,
                deadline: now + self.deadline,
            };
            self.owners.entry(piece).or_default().push(assignment);
            self.per_peer.entry(*peer).or_default().push(piece);
            debug!("Piece {} assigned to {}", piece, peer);
            return Some(piece);
        }
        None
    }

    /// Pieces currently reserved for the peer.
    pub fn active_for_peer(&self, peer: &Peer) -> Vec<u32> {
        self.per_peer.get(peer).cloned().unwrap_or_default()
    }

    pub fn is_assigned(&self, piece: u32) -> bool {
        self.owners
            .get(&piece)
            .map(|owners| !owners.is_empty())
            .unwrap_or(false)
    }

    /// Clears every reservation of a verified piece and returns the
    /// peers that were still working on it (endgame losers get a
    /// CANCEL from their sessions).
    pub fn mark_verified(&mut self, piece: u32) -> Vec<Peer> {
        let owners = match self.owners.remove(&piece) {
            Some(owners) => owners,
            None => return vec![],
        };
        for assignment in &owners {
            self.remove_from_peer(&assignment.peer, piece);
        }
        owners.into_iter().map(|a| a.peer).collect()
    }

    /// Drops one peer's reservation after a failed delivery (hash
    /// mismatch, storage failure) and blames the peer. The piece
    /// returns to the selectable pool.
    pub fn fail(&mut self, peer: &Peer, piece: u32) {
        if let Some(owners) = self.owners.get_mut(&piece) {
            owners.retain(|a| a.peer != *peer);
            if owners.is_empty() {
                self.owners.remove(&piece);
            }
        }
        self.remove_from_peer(peer, piece);
        self.blame(peer);
    }

    /// Releases everything a disconnecting peer held; the pieces are
    /// selectable again. No blame.
    pub fn release_peer(&mut self, peer: &Peer) -> Vec<u32> {
        let pieces = self.per_peer.remove(peer).unwrap_or_default();
        for piece in &pieces {
            if let Some(owners) = self.owners.get_mut(piece) {
                owners.retain(|a| a.peer != *peer);
                if owners.is_empty() {
                    self.owners.remove(piece);
                }
            }
        }
        pieces
    }

    /// Drops assignments whose deadline has passed, blaming the owner.
    /// Returns the reassignable (peer, piece) pairs.
    pub fn expire(&mut self, now: Instant) -> Vec<(Peer, u32)> {
        let mut expired = Vec::new();
        for (piece, owners) in &self.owners {
            for assignment in owners {
                if assignment.deadline <= now {
                    expired.push((assignment.peer, *piece));
                }
            }
        }
        for (peer, piece) in &expired {
            if let Some(owners) = self.owners.get_mut(piece) {
                owners.retain(|a| a.peer != *peer);
                if owners.is_empty() {
                    self.owners.remove(piece);
                }
            }
            self.remove_from_peer(peer, *piece);
            self.blame(peer);
            debug!("Assignment of piece {} to {} expired", piece, peer);
        }
        expired
    }

    /// Attributes a failure to the peer for reputation purposes.
    pub fn blame(&mut self, peer: &Peer) {
        *self.failures.entry(*peer).or_insert(0) += 1;
    }

    pub fn failures(&self, peer: &Peer) -> u32 {
        self.failures.get(peer).copied().unwrap_or(0)
    }

    fn remove_from_peer(&mut self, peer: &Peer, piece: u32) {
        if let Some(pieces) = self.per_peer.get_mut(peer) {
            pieces.retain(|p| *p != piece);
            if pieces.is_empty() {
                self.per_peer.remove(peer);
            }
        }
    }
}
