//! Deterministic, platform-independent hashing of packed keys
//!
//! Ownership decisions must agree on every process, so the partition hash
//! uses only integer arithmetic with a fixed seed: a splitmix64 pre-mix of
//! the seed followed by the murmur3 64-bit finalizer. Unlike the
//! `ahash` state used for the in-memory maps, the output does not depend on
//! CPU features, crate versions or process-local randomness.

/// A deterministic hasher with a fixed seed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeterministicHasher {
    mixed_seed: u64,
}

impl DeterministicHasher {
    /// Create a new deterministic hasher with the given seed
    pub fn new(seed: u64) -> Self {
        Self {
            mixed_seed: splitmix64(seed),
        }
    }

    /// Hash a u64 value
    #[inline]
    pub fn hash_u64(&self, value: u64) -> u64 {
        fmix64(value ^ self.mixed_seed)
    }
}

#[inline]
const fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
const fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    k ^= k >> 33;
    k = k.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    k ^= k >> 33;
    k
}
