//! Distributed index lifecycle
//!
//! Drives one process's share of a build:
//! 1. Map the input and take this process's record-aligned block
//! 2. Cut it into chunks and run them on a rayon pool
//! 3. Encode windows into keys, accumulate per worker, hand full
//!    accumulators to the exchange
//! 4. `finalize` collectively; afterwards the local index is read-only
//!
//! Every process of the cluster must construct its index with the same
//! configuration, build the same files in the same order and call
//! `finalize` (or drop the index, which aborts).

use std::ops::Range;
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::accumulator::LocalAccumulator;
use crate::comm::Communicator;
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::exchange::{Exchange, ExchangeSender, ExchangeStats, LocalIndex};
use crate::io::{ChunkReader, RecordError, RecordParser, SequenceFormat};
use crate::kmer::KmerEncoder;
use crate::partition::Partitioner;
use crate::payload::{global_offset, MergeStrategy, Payload, QualityProfile};

/// Lifecycle state of a [`DistributedIndex`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    /// Constructed, nothing built yet
    Created,
    /// At least one file has been built
    Building,
    /// The termination protocol is running
    Finalizing,
    /// Complete and queryable
    Finalized,
    /// A fatal error occurred here or on a peer
    Aborted,
}

/// Counters for one `build` call (or the sum of several)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Bytes of input read by this process
    pub bytes: u64,
    /// Chunks processed
    pub chunks: u64,
    /// Well-formed records processed
    pub records: u64,
    /// Records skipped because they were malformed
    pub malformed_records: u64,
    /// Windows emitted as keys
    pub kmers: u64,
    /// Windows skipped because they held an out-of-alphabet symbol
    pub skipped_windows: u64,
    /// Batches handed to the exchange
    pub batches: u64,
}

impl BuildStats {
    /// Sum of two sets of counters
    pub fn combined(self, other: BuildStats) -> BuildStats {
        BuildStats {
            bytes: self.bytes + other.bytes,
            chunks: self.chunks + other.chunks,
            records: self.records + other.records,
            malformed_records: self.malformed_records + other.malformed_records,
            kmers: self.kmers + other.kmers,
            skipped_windows: self.skipped_windows + other.skipped_windows,
            batches: self.batches + other.batches,
        }
    }
}

/// One process's handle onto a distributed k-mer index
pub struct DistributedIndex<C: Communicator> {
    config: IndexConfig,
    encoder: KmerEncoder,
    partitioner: Partitioner,
    rank: usize,
    nprocs: usize,
    state: IndexState,
    exchange: Option<Exchange<C>>,
    comm: Option<C>,
    index: LocalIndex,
    files_built: u32,
    totals: BuildStats,
    exchange_stats: ExchangeStats,
}

impl<C: Communicator> DistributedIndex<C> {
    /// Create an empty index on top of `comm`
    ///
    /// No input is read. The communication thread starts here and owns
    /// `comm` until [`finalize`](Self::finalize) hands it back.
    ///
    /// # Errors
    /// - [`IndexError::InvalidConfig`] for bad parameters
    /// - [`IndexError::ThreadSupport`] if `comm` cannot be used from a
    ///   dedicated thread
    pub fn new(comm: C, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let encoder = KmerEncoder::new(config.k, config.alphabet, config.canonical)?;
        let rank = comm.rank();
        let nprocs = comm.size();
        let partitioner = Partitioner::new(nprocs, config.partition_seed);
        let exchange = Exchange::start(comm, &config)?;

        if rank == 0 {
            config.print();
        }
        debug!(rank, nprocs, "index created");

        Ok(Self {
            config,
            encoder,
            partitioner,
            rank,
            nprocs,
            state: IndexState::Created,
            exchange: Some(exchange),
            comm: None,
            index: LocalIndex::default(),
            files_built: 0,
            totals: BuildStats::default(),
            exchange_stats: ExchangeStats::default(),
        })
    }

    /// Rank of this process
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of processes sharing the index
    pub fn num_processes(&self) -> usize {
        self.nprocs
    }

    /// Current lifecycle state
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Configuration the index was created with
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Encoder used to turn windows into keys; useful to decode keys
    pub fn encoder(&self) -> &KmerEncoder {
        &self.encoder
    }

    /// Counters summed over every `build` call so far
    pub fn build_stats(&self) -> BuildStats {
        self.totals
    }

    /// Exchange counters, available once finalized
    pub fn exchange_stats(&self) -> ExchangeStats {
        self.exchange_stats
    }

    /// Number of keys held by this process
    ///
    /// While building this is a snapshot of keys merged so far.
    pub fn local_size(&self) -> usize {
        match &self.exchange {
            Some(exchange) => exchange.local_size(),
            None => self.index.len(),
        }
    }

    /// Add every k-mer of `path` using the configured thread count and chunk size
    pub fn build_file(&mut self, path: impl AsRef<Path>) -> Result<BuildStats> {
        self.build(path, self.config.num_threads, self.config.chunk_size)
    }

    /// Add every k-mer of `path` to the index
    ///
    /// Uses `threads` workers (0 = all cores) over chunks of about
    /// `chunk_size` bytes (0 = page size). Returns once this process's part
    /// of the file has been processed and handed to the exchange; pairs may
    /// still be in flight to their owners. May be called again with further
    /// files before [`finalize`](Self::finalize).
    ///
    /// Malformed records and windows with out-of-alphabet symbols are
    /// skipped and counted. Any returned error aborts the index.
    pub fn build(
        &mut self,
        path: impl AsRef<Path>,
        threads: usize,
        chunk_size: usize,
    ) -> Result<BuildStats> {
        match self.state {
            IndexState::Created | IndexState::Building => {}
            state => {
                return Err(IndexError::InvalidState {
                    operation: "build",
                    state,
                })
            }
        }
        self.state = IndexState::Building;

        let path = path.as_ref();
        match self.build_inner(path, threads, chunk_size) {
            Ok(stats) => {
                self.totals = self.totals.combined(stats);
                Ok(stats)
            }
            Err(e) => {
                error!(rank = self.rank, path = %path.display(), error = %e, "build failed");
                self.state = IndexState::Aborted;
                Err(e)
            }
        }
    }

    fn build_inner(&mut self, path: &Path, threads: usize, chunk_size: usize) -> Result<BuildStats> {
        let start = Instant::now();
        let file_ordinal = u16::try_from(self.files_built).map_err(|_| {
            IndexError::InvalidConfig(format!("at most {} input files per index", u16::MAX as u32 + 1))
        })?;
        self.files_built += 1;

        let reader = ChunkReader::open(path, self.config.max_record_bytes)?;
        let strategy = self.config.strategy;
        if strategy.needs_quality() && !reader.is_empty() && !reader.format().has_quality() {
            return Err(IndexError::Format {
                path: path.to_path_buf(),
                detail: format!("the {strategy} payload needs FASTQ qualities, found {}", reader.format()),
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| IndexError::ThreadPool(e.to_string()))?;

        let range = reader.process_range(self.rank, self.nprocs)?;
        let chunks = reader.chunks(range.clone(), chunk_size, pool.current_num_threads())?;
        info!(
            rank = self.rank,
            phase = "build",
            path = %path.display(),
            bytes = range.len(),
            chunks = chunks.len(),
            threads = pool.current_num_threads(),
            "processing input"
        );

        let exchange = self.exchange.as_ref().ok_or(IndexError::Disconnected)?;
        let ctx = ChunkContext {
            reader: &reader,
            encoder: self.encoder,
            partitioner: self.partitioner,
            strategy,
            capacity: self.config.accumulator_capacity,
            file_ordinal,
            sender: exchange.sender(),
            rank: self.rank,
        };

        let stats = pool.install(|| {
            chunks
                .par_iter()
                .map_init(
                    || LocalAccumulator::new(strategy, ctx.capacity),
                    |acc, chunk| ctx.process(chunk.clone(), acc),
                )
                .try_reduce(BuildStats::default, |a, b| Ok(a.combined(b)))
        })?;

        info!(
            rank = self.rank,
            phase = "build",
            records = stats.records,
            malformed_records = stats.malformed_records,
            kmers = stats.kmers,
            skipped_windows = stats.skipped_windows,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "input processed"
        );
        Ok(stats)
    }

    /// Complete the index on every process
    ///
    /// Collective: blocks until every process has finalized (or dropped its
    /// index). If any process aborted, every process gets
    /// [`IndexError::Aborted`] and no partial index becomes queryable.
    pub fn finalize(&mut self) -> Result<()> {
        let ok = match self.state {
            IndexState::Created | IndexState::Building => true,
            IndexState::Aborted if self.exchange.is_some() => false,
            state => {
                return Err(IndexError::InvalidState {
                    operation: "finalize",
                    state,
                })
            }
        };
        let Some(exchange) = self.exchange.take() else {
            return Err(IndexError::InvalidState {
                operation: "finalize",
                state: self.state,
            });
        };

        self.state = IndexState::Finalizing;
        let start = Instant::now();
        let (comm, result) = exchange.finish(ok);
        self.comm = comm;
        match result {
            Ok((index, stats)) => {
                self.index = index;
                self.exchange_stats = stats;
                self.state = IndexState::Finalized;
                info!(
                    rank = self.rank,
                    phase = "finalize",
                    keys = self.index.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "index finalized"
                );
                Ok(())
            }
            Err(e) => {
                self.state = IndexState::Aborted;
                Err(e)
            }
        }
    }

    fn ensure_finalized(&self, operation: &'static str) -> Result<()> {
        if self.state == IndexState::Finalized {
            Ok(())
        } else {
            Err(IndexError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Keys owned by this process and their payloads, in unspecified order
    ///
    /// Each call starts a fresh pass over the same contents.
    pub fn iter(&self) -> Result<impl Iterator<Item = (u64, &Payload)> + '_> {
        self.ensure_finalized("iterate")?;
        Ok(self.index.iter().map(|(key, payload)| (*key, payload)))
    }

    /// The finalized local index
    pub fn local_index(&self) -> Result<&LocalIndex> {
        self.ensure_finalized("read")?;
        Ok(&self.index)
    }

    /// Payload stored for `key`, if this process owns it and it occurred
    pub fn get(&self, key: u64) -> Result<Option<&Payload>> {
        self.ensure_finalized("query")?;
        Ok(self.index.get(&key))
    }

    /// Rank that owns `key`
    pub fn owner_of(&self, key: u64) -> usize {
        self.partitioner.owner(key)
    }

    /// Give the communicator back once the exchange has stopped
    ///
    /// Dropping an unfinalized index this way aborts it first.
    pub fn into_communicator(mut self) -> Option<C> {
        if let Some(exchange) = self.exchange.take() {
            self.state = IndexState::Aborted;
            self.comm = exchange.finish(false).0;
        }
        self.comm.take()
    }
}

impl<C: Communicator> Drop for DistributedIndex<C> {
    fn drop(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            warn!(rank = self.rank, state = ?self.state, "index dropped before finalize; aborting");
            let _ = exchange.finish(false);
        }
    }
}

/// Everything a worker needs to process one chunk
struct ChunkContext<'a> {
    reader: &'a ChunkReader,
    encoder: KmerEncoder,
    partitioner: Partitioner,
    strategy: MergeStrategy,
    capacity: usize,
    file_ordinal: u16,
    sender: ExchangeSender,
    rank: usize,
}

impl ChunkContext<'_> {
    fn process(&self, chunk: Range<usize>, acc: &mut LocalAccumulator) -> Result<BuildStats> {
        let format: SequenceFormat = self.reader.format();
        let data = &self.reader.data()[chunk.clone()];
        let k = self.encoder.k();
        let needs_quality = self.strategy.needs_quality();
        let mut stats = BuildStats {
            bytes: chunk.len() as u64,
            chunks: 1,
            ..BuildStats::default()
        };

        let parser = RecordParser::new(format, data, chunk.start as u64)
            .at_eof(chunk.end == self.reader.len());
        for item in parser {
            let record = match item {
                Ok(record) => record,
                Err(RecordError::Undecodable { offset, reason }) => {
                    return Err(IndexError::Malformed { offset, detail: reason });
                }
                Err(e @ RecordError::Malformed { offset, .. }) => {
                    warn!(rank = self.rank, offset, error = %e, "skipping record");
                    stats.malformed_records += 1;
                    continue;
                }
            };
            stats.records += 1;

            let profile = match (needs_quality, record.qual) {
                (true, Some(qual)) => QualityProfile::new(qual),
                (true, None) => {
                    return Err(IndexError::Malformed {
                        offset: record.offset,
                        detail: "record has no quality string".into(),
                    })
                }
                (false, _) => QualityProfile::default(),
            };

            let mut windows = self.encoder.windows(&record.seq);
            for (key, offset) in windows.by_ref() {
                let position = global_offset(self.file_ordinal, record.offset + offset as u64);
                let quality = if needs_quality { profile.window(offset, k) } else { 0.0 };
                acc.insert_occurrence(key, position, quality);
                stats.kmers += 1;
                if acc.is_full() {
                    self.drain(acc, &mut stats)?;
                }
            }
            stats.skipped_windows += windows.skipped();
        }

        self.drain(acc, &mut stats)?;
        debug!(
            rank = self.rank,
            offset = chunk.start,
            bytes = stats.bytes,
            records = stats.records,
            kmers = stats.kmers,
            "chunk processed"
        );
        Ok(stats)
    }

    fn drain(&self, acc: &mut LocalAccumulator, stats: &mut BuildStats) -> Result<()> {
        for (owner, batch) in acc.drain_partitioned(&self.partitioner) {
            self.sender.send(owner, batch)?;
            stats.batches += 1;
        }
        Ok(())
    }
}
