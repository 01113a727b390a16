//! Construction parameters for a distributed index

use std::time::Duration;

use crate::alphabet::Alphabet;
use crate::constants::{
    DEFAULT_ACCUMULATOR_CAPACITY, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_K, DEFAULT_MAX_RECORD_BYTES,
    DEFAULT_PARTITION_SEED, DEFAULT_QUEUE_DEPTH, DEFAULT_SEND_BATCH_SIZE,
};
use crate::error::{IndexError, Result};
use crate::payload::MergeStrategy;

/// Parameters shared by every process building one index
///
/// `k`, `alphabet`, `strategy`, `canonical` and `partition_seed` must be
/// identical on all processes; the rest only tune local behavior.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// K-mer length, `1..=alphabet.max_k()`
    pub k: usize,

    /// Symbol set keys are packed with
    pub alphabet: Alphabet,

    /// What is stored per key and how duplicates merge
    pub strategy: MergeStrategy,

    /// Fold each k-mer with its reverse complement
    pub canonical: bool,

    /// Worker threads per build (0 = all available cores)
    pub num_threads: usize,

    /// Nominal chunk size in bytes (0 = host page size)
    pub chunk_size: usize,

    /// Distinct keys a worker holds before handing them to the exchange
    pub accumulator_capacity: usize,

    /// Pairs buffered per destination before a frame is sent
    pub send_batch_size: usize,

    /// Longest a non-empty send buffer may wait before it is flushed
    pub flush_interval: Duration,

    /// Batches the exchange queue holds before producers block
    pub queue_depth: usize,

    /// Furthest a chunk boundary may be moved to reach a record start
    pub max_record_bytes: usize,

    /// Seed of the key-to-owner hash
    pub partition_seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alphabet: Alphabet::Dna,
            strategy: MergeStrategy::AppendPosition,
            canonical: false,
            num_threads: 0,
            chunk_size: 0,
            accumulator_capacity: DEFAULT_ACCUMULATOR_CAPACITY,
            send_batch_size: DEFAULT_SEND_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            partition_seed: DEFAULT_PARTITION_SEED,
        }
    }
}

impl IndexConfig {
    /// Default configuration with the given k-mer length and merge strategy
    pub fn new(k: usize, strategy: MergeStrategy) -> Result<Self> {
        let config = Self {
            k,
            strategy,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter
    pub fn validate(&self) -> Result<()> {
        let max_k = self.alphabet.max_k();
        if self.k == 0 || self.k > max_k {
            return Err(IndexError::InvalidConfig(format!(
                "k must be in range [1, {max_k}] for the {} alphabet, got k={}",
                self.alphabet, self.k
            )));
        }
        if self.accumulator_capacity == 0 {
            return Err(IndexError::InvalidConfig(
                "accumulator_capacity must be positive".into(),
            ));
        }
        if self.send_batch_size == 0 {
            return Err(IndexError::InvalidConfig("send_batch_size must be positive".into()));
        }
        if self.queue_depth == 0 {
            return Err(IndexError::InvalidConfig("queue_depth must be positive".into()));
        }
        if self.max_record_bytes == 0 {
            return Err(IndexError::InvalidConfig("max_record_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Index Configuration:");
        tracing::info!("  k = {}", self.k);
        tracing::info!("  alphabet = {}", self.alphabet);
        tracing::info!("  payload = {}", self.strategy);
        tracing::info!("  canonical = {}", self.canonical);
        if self.num_threads == 0 {
            tracing::info!("  num_threads = all available cores");
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
        if self.chunk_size == 0 {
            tracing::debug!("  chunk_size = page size");
        } else {
            tracing::debug!("  chunk_size = {}", self.chunk_size);
        }
        tracing::debug!("  accumulator_capacity = {}", self.accumulator_capacity);
        tracing::debug!("  send_batch_size = {}", self.send_batch_size);
        tracing::debug!("  flush_interval = {:?}", self.flush_interval);
        tracing::debug!("  queue_depth = {}", self.queue_depth);
        tracing::debug!("  max_record_bytes = {}", self.max_record_bytes);
        tracing::debug!("  partition_seed = {:#x}", self.partition_seed);
    }
}
