//! Content-addressed shard assignment
//!
//! `owner(key) = hash(key) mod nprocs`. The hash is seeded identically on
//! every process, so any thread of any process can decide where a pair
//! belongs without negotiation.

use crate::hasher::DeterministicHasher;

/// Maps keys to owning process ranks
#[derive(Clone, Copy, Debug)]
pub struct Partitioner {
    nprocs: usize,
    hasher: DeterministicHasher,
}

impl Partitioner {
    /// Create a partitioner over `nprocs` processes
    ///
    /// # Panics
    /// Panics if `nprocs` is zero.
    pub fn new(nprocs: usize, seed: u64) -> Self {
        assert!(nprocs > 0, "process count must be positive");
        Self {
            nprocs,
            hasher: DeterministicHasher::new(seed),
        }
    }

    /// Number of processes keys are spread over
    #[inline]
    pub fn num_processes(&self) -> usize {
        self.nprocs
    }

    /// Rank that owns `key`
    #[inline]
    pub fn owner(&self, key: u64) -> usize {
        if self.nprocs == 1 {
            return 0;
        }
        (self.hasher.hash_u64(key) % self.nprocs as u64) as usize
    }
}
