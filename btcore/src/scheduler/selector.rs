use rand::seq::SliceRandom;

use crate::bitfield::Bitfield;

use super::stats::PieceStatistics;

/// Piece ordering policy for the download scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Strictly ascending availability, ties by index.
    RarestFirst,
    /// Ascending availability with uniform shuffling inside each run
    /// of equal counts, so ties break fairly across peers.
    RandomizedRarest,
    /// Ascending piece index.
    Sequential,
}

/// Availability-ordered key: `(piece << 32) | count` packed into 64
/// bits, compared count-major so a sorted run is rarest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceKey(u64);

impl PieceKey {
    pub fn new(piece: u32, count: u32) -> Self {
        Self(((piece as u64) << 32) | count as u64)
    }

    pub fn piece(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn count(&self) -> u32 {
        self.0 as u32
    }
}

impl Ord for PieceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.count()
            .cmp(&other.count())
            .then(self.piece().cmp(&other.piece()))
    }
}

impl PartialOrd for PieceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders candidate pieces for assignment.
///
/// A piece is a candidate when the local side does not have it yet and
/// at least one connected peer advertises it.
#[derive(Debug, Clone)]
pub struct PieceSelector {
    strategy: SelectionStrategy,
}

impl PieceSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Emits the candidate pieces in strategy order. Callers consume a
    /// prefix; the tail costs nothing but its sort.
    pub fn order(&self, stats: &PieceStatistics, have: &Bitfield) -> Vec<u32> {
        let mut keys: Vec<PieceKey> = (0..stats.piece_count() as u32)
            .filter(|index| !have.has_piece(*index))
            .filter_map(|index| match stats.count(index) {
                Ok(count) if count > 0 => Some(PieceKey::new(index, count)),
                _ => None,
            })
            .collect();

        match self.strategy {
            SelectionStrategy::Sequential => {
                keys.sort_by_key(|key| key.piece());
            }
            SelectionStrategy::RarestFirst => {
                keys.sort();
            }
            SelectionStrategy::RandomizedRarest => {
                keys.sort();
                Self::shuffle_equal_count_runs(&mut keys);
            }
        }

        keys.into_iter().map(|key| key.piece()).collect()
    }

    /// Shuffles each run of equal availability in place; runs never
    /// exchange members.
    fn shuffle_equal_count_runs(keys: &mut [PieceKey]) {
        let mut rng = rand::thread_rng();
        let mut start = 0;
        while start < keys.len() {
            let count = keys[start].count();
            let mut end = start + 1;
            while end < keys.len() && keys[end].count() == count {
                end += 1;
            }
            keys[start..end].shuffle(&mut rng);
            start = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_piece_key_packing() {
        let key = PieceKey::new(7, 3);
        assert_eq!(key.piece(), 7);
        assert_eq!(key.count(), 3);
    }

    #[test]
    fn test_piece_key_orders_count_major() {
        let mut keys = vec![
            PieceKey::new(0, 5),
            PieceKey::new(9, 1),
            PieceKey::new(4, 1),
            PieceKey::new(1, 3),
        ];
        keys.sort();

        let pieces: Vec<u32> = keys.iter().map(|key| key.piece()).collect();
        assert_eq!(pieces, vec![4, 9, 1, 0]);
    }

    #[test]
    fn test_rarest_first_is_availability_sorted() {
        let stats = build_stats(&[3, 1, 4, 1, 2]);
        let selector = PieceSelector::new(SelectionStrategy::RarestFirst);

        let order = selector.order(&stats, &Bitfield::new(5));
        assert_eq!(order, vec![1, 3, 4, 0, 2]);
    }

    #[test]
    fn test_unavailable_pieces_are_never_emitted() {
        let stats = build_stats(&[0, 2, 0, 1]);
        let selector = PieceSelector::new(SelectionStrategy::RarestFirst);

        let order = selector.order(&stats, &Bitfield::new(4));
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn test_local_pieces_are_omitted() {
        let stats = build_stats(&[1, 1, 1, 1]);
        let mut have = Bitfield::new(4);
        have.set_bit(1, true).unwrap();
        have.set_bit(2, true).unwrap();

        let selector = PieceSelector::new(SelectionStrategy::RarestFirst);
        assert_eq!(selector.order(&stats, &have), vec![0, 3]);
    }

    #[test]
    fn test_sequential_is_index_sorted() {
        let stats = build_stats(&[3, 1, 4, 1, 2]);
        let selector = PieceSelector::new(SelectionStrategy::Sequential);

        assert_eq!(selector.order(&stats, &Bitfield::new(5)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_randomized_runs_never_swap_members() {
        let stats = build_stats(&[3, 1, 1, 1, 2]);
        let selector = PieceSelector::new(SelectionStrategy::RandomizedRarest);

        for _ in 0..100 {
            let order = selector.order(&stats, &Bitfield::new(5));
            let mut head: Vec<u32> = order[..3].to_vec();
            head.sort_unstable();
            assert_eq!(head, vec![1, 2, 3]);
            assert_eq!(order[3], 4);
            assert_eq!(order[4], 0);
        }
    }

    #[test]
    fn test_randomized_tie_break_is_roughly_uniform() {
        let stats = build_stats(&[3, 1, 1, 1, 2]);
        let selector = PieceSelector::new(SelectionStrategy::RandomizedRarest);

        let mut first_counts: HashMap<u32, u32> = HashMap::new();
        for _ in 0..1000 {
            let order = selector.order(&stats, &Bitfield::new(5));
            *first_counts.entry(order[0]).or_insert(0) += 1;
        }

        // Expect ~333 first-position hits per member of the count-1 run;
        // the bounds stay far outside chance fluctuation at n=1000.
        for index in [1u32, 2, 3] {
            let hits = *first_counts.get(&index).unwrap_or(&0);
            assert!(
                (230..=440).contains(&hits),
                "piece {} won first place {} times out of 1000",
                index,
                hits
            );
        }
        assert_eq!(first_counts.get(&0), None);
        assert_eq!(first_counts.get(&4), None);
    }

    // Auxiliary functions

    fn build_stats(counts: &[u32]) -> PieceStatistics {
        let mut stats = PieceStatistics::new(counts.len());
        for (index, count) in counts.iter().enumerate() {
            for _ in 0..*count {
                stats.peer_have(index as u32).unwrap();
            }
        }
        stats
    }
}
