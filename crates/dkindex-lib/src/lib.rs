// dkindex: distributed k-mer index construction
//
// Builds a hash-partitioned k-mer index from FASTA/FASTQ input across a set
// of cooperating processes, each holding the k-mers it owns.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod accumulator;
pub mod alphabet;
pub mod comm;
pub mod config;
pub mod constants;
pub mod error;
pub mod exchange;
pub mod hasher;
pub mod index;
pub mod io;
pub mod kmer;
pub mod partition;
pub mod payload;

// Re-export common types at crate root
pub use alphabet::Alphabet;
pub use comm::{Communicator, Endpoint, LocalCluster, ThreadLevel};
pub use config::IndexConfig;
pub use error::{IndexError, Result};
pub use exchange::{ExchangeStats, LocalIndex};
pub use index::{BuildStats, DistributedIndex, IndexState};
pub use io::SequenceFormat;
pub use kmer::KmerEncoder;
pub use partition::Partitioner;
pub use payload::{MergeStrategy, Payload};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
