//! Thread-confined accumulation of (key, payload) pairs
//!
//! Each worker owns one accumulator, so inserts need no synchronization.
//! Repeated keys are merged on the spot, which shrinks what has to cross
//! the exchange. Once the map holds `capacity` distinct keys it should be
//! drained into per-owner batches.

use std::collections::HashMap;

use ahash::RandomState;

use crate::partition::Partitioner;
use crate::payload::{MergeStrategy, Payload};

/// Pairs destined for one process
pub type Batch = Vec<(u64, Payload)>;

/// Per-worker partial index
pub struct LocalAccumulator {
    strategy: MergeStrategy,
    capacity: usize,
    map: HashMap<u64, Payload, RandomState>,
}

impl LocalAccumulator {
    /// Create an accumulator that reports full at `capacity` distinct keys
    pub fn new(strategy: MergeStrategy, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            strategy,
            capacity,
            map: HashMap::with_capacity_and_hasher(capacity.min(1 << 20), RandomState::new()),
        }
    }

    /// Record one occurrence of `key`
    #[inline]
    pub fn insert_occurrence(&mut self, key: u64, position: u64, quality: f32) {
        self.insert(key, self.strategy.occurrence(position, quality));
    }

    /// Insert a payload, merging with any existing entry for `key`
    #[inline]
    pub fn insert(&mut self, key: u64, payload: Payload) {
        match self.map.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(payload),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(payload);
            }
        }
    }

    /// Number of distinct keys held
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether the accumulator should be drained
    #[inline]
    pub fn is_full(&self) -> bool {
        self.map.len() >= self.capacity
    }

    /// Empty the map into one batch per owning process
    ///
    /// Returns `(owner, batch)` pairs; owners with nothing to receive are
    /// left out.
    pub fn drain_partitioned(&mut self, partitioner: &Partitioner) -> Vec<(usize, Batch)> {
        let nprocs = partitioner.num_processes();
        let mut batches: Vec<Batch> = vec![Vec::new(); nprocs];
        for (key, payload) in self.map.drain() {
            batches[partitioner.owner(key)].push((key, payload));
        }
        batches
            .into_iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_keys_merge() {
        let mut acc = LocalAccumulator::new(MergeStrategy::IncrementCount, 16);
        acc.insert_occurrence(7, 0, 0.0);
        acc.insert_occurrence(7, 5, 0.0);
        acc.insert_occurrence(9, 1, 0.0);
        assert_eq!(acc.len(), 2);

        let batches = acc.drain_partitioned(&Partitioner::new(1, 0));
        assert!(acc.is_empty());
        assert_eq!(batches.len(), 1);
        let (owner, mut batch) = batches.into_iter().next().unwrap();
        assert_eq!(owner, 0);
        batch.sort_by_key(|(k, _)| *k);
        assert_eq!(batch, vec![(7, Payload::Count(2)), (9, Payload::Count(1))]);
    }

    #[test]
    fn test_is_full_at_capacity() {
        let mut acc = LocalAccumulator::new(MergeStrategy::AppendPosition, 2);
        acc.insert_occurrence(1, 10, 0.0);
        assert!(!acc.is_full());
        acc.insert_occurrence(1, 11, 0.0);
        assert!(!acc.is_full());
        acc.insert_occurrence(2, 12, 0.0);
        assert!(acc.is_full());
    }

    #[test]
    fn test_drain_routes_to_owners() {
        let partitioner = Partitioner::new(3, 99);
        let mut acc = LocalAccumulator::new(MergeStrategy::AppendPosition, 1024);
        for key in 0..300u64 {
            acc.insert_occurrence(key, key * 10, 0.0);
        }
        let batches = acc.drain_partitioned(&partitioner);
        let mut total = 0;
        for (owner, batch) in batches {
            total += batch.len();
            for (key, payload) in batch {
                assert_eq!(partitioner.owner(key), owner);
                assert_eq!(payload, Payload::Positions(vec![key * 10]));
            }
        }
        assert_eq!(total, 300);
    }
}
