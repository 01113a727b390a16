use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use dkindex_lib::constants::DEFAULT_MAX_RECORD_BYTES;
use dkindex_lib::io::ChunkReader;
use dkindex_lib::{
    Alphabet, BuildStats, Communicator, DistributedIndex, Endpoint, IndexConfig, LocalCluster,
    MergeStrategy,
};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dkindex")]
#[command(version = "0.1.0")]
#[command(about = "Distributed k-mer index construction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build index variants over an in-process cluster and time them
    Bench {
        /// Input FASTA/FASTQ file
        #[arg(short, long)]
        input: PathBuf,

        /// K-mer length
        #[arg(short, long, default_value = "21")]
        k: usize,

        /// Symbol set (dna, rna or dna5)
        #[arg(short, long, default_value = "dna")]
        alphabet: Alphabet,

        /// Number of ranks, each run as a thread
        #[arg(short, long, default_value = "1")]
        procs: usize,

        /// Worker threads per rank (0 = all available cores)
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,

        /// Nominal chunk size in bytes (0 = page size)
        #[arg(short = 'c', long, default_value = "0")]
        chunk_size: usize,

        /// Fold each k-mer with its reverse complement
        #[arg(long, default_value = "false")]
        canonical: bool,

        /// Payload variant(s) to build
        #[arg(long, value_enum, default_value = "all")]
        payload: PayloadArg,

        /// Print every entry after finalize
        #[arg(long)]
        dump: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PayloadArg {
    Positions,
    Count,
    Quality,
    All,
}

impl PayloadArg {
    fn strategies(self) -> Vec<MergeStrategy> {
        match self {
            PayloadArg::Positions => vec![MergeStrategy::AppendPosition],
            PayloadArg::Count => vec![MergeStrategy::IncrementCount],
            PayloadArg::Quality => vec![MergeStrategy::BestQuality],
            PayloadArg::All => vec![
                MergeStrategy::AppendPosition,
                MergeStrategy::IncrementCount,
                MergeStrategy::BestQuality,
            ],
        }
    }
}

/// Per-rank build settings shared by every rank of one run
#[derive(Clone)]
struct RunSettings {
    input: PathBuf,
    threads: usize,
    chunk_size: usize,
    dump: bool,
}

struct VariantSummary {
    keys: usize,
    stats: BuildStats,
    elapsed: Duration,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            input,
            k,
            alphabet,
            procs,
            threads,
            chunk_size,
            canonical,
            payload,
            dump,
        } => {
            let base = IndexConfig {
                k,
                alphabet,
                canonical,
                num_threads: threads,
                chunk_size,
                ..IndexConfig::default()
            };
            let settings = RunSettings {
                input,
                threads,
                chunk_size,
                dump,
            };
            bench_command(base, payload, procs, settings)?;
        }
    }

    Ok(())
}

/// Build each selected payload variant in turn and report timings
fn bench_command(
    base: IndexConfig,
    payload: PayloadArg,
    procs: usize,
    settings: RunSettings,
) -> anyhow::Result<()> {
    if procs == 0 {
        return Err(anyhow!("--procs must be at least 1"));
    }
    base.validate()?;

    let format = ChunkReader::open(&settings.input, DEFAULT_MAX_RECORD_BYTES)
        .with_context(|| format!("Failed to open {}", settings.input.display()))?
        .format();

    info!("Benchmarking distributed k-mer index...");
    info!("  Input: {} ({})", settings.input.display(), format);
    info!("  k: {}", base.k);
    info!("  Ranks: {}", procs);
    info!("  Threads per rank: {}", settings.threads);
    info!("  Canonical: {}", base.canonical);

    let mut variants = Vec::new();
    for strategy in payload.strategies() {
        if strategy.needs_quality() && !format.has_quality() {
            warn!("Skipping {} payload: {} input has no qualities", strategy, format);
            continue;
        }
        variants.push(IndexConfig {
            strategy,
            ..base.clone()
        });
    }

    let per_rank = run_cluster(&variants, procs, &settings)?;
    for (i, config) in variants.iter().enumerate() {
        let summaries: Vec<&VariantSummary> = per_rank.iter().map(|rank| &rank[i]).collect();
        let keys: usize = summaries.iter().map(|s| s.keys).sum();
        let kmers: u64 = summaries.iter().map(|s| s.stats.kmers).sum();
        let records: u64 = summaries.iter().map(|s| s.stats.records).sum();
        let malformed: u64 = summaries.iter().map(|s| s.stats.malformed_records).sum();
        let slowest = summaries
            .iter()
            .map(|s| s.elapsed)
            .max()
            .unwrap_or_default();
        info!(
            "{} index: {} records ({} malformed), {} k-mers, {} distinct keys in {:.3}s",
            config.strategy,
            records,
            malformed,
            kmers,
            keys,
            slowest.as_secs_f64()
        );
    }

    Ok(())
}

/// Run every variant on `procs` in-process ranks; one summary list per rank
fn run_cluster(
    variants: &[IndexConfig],
    procs: usize,
    settings: &RunSettings,
) -> anyhow::Result<Vec<Vec<VariantSummary>>> {
    let mut handles = Vec::with_capacity(procs);
    for ep in LocalCluster::new(procs) {
        let variants = variants.to_vec();
        let settings = settings.clone();
        let handle = thread::Builder::new()
            .name(format!("rank-{}", ep.rank()))
            .spawn(move || run_rank(ep, &variants, &settings))
            .context("Failed to spawn rank thread")?;
        handles.push(handle);
    }

    let mut per_rank = Vec::with_capacity(procs);
    let mut failure = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(summaries)) => per_rank.push(summaries),
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(_) => {
                failure.get_or_insert(anyhow!("rank thread panicked"));
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(per_rank),
    }
}

/// Build the variants one after another, reusing the rank's communicator
fn run_rank(
    ep: Endpoint,
    variants: &[IndexConfig],
    settings: &RunSettings,
) -> anyhow::Result<Vec<VariantSummary>> {
    let rank = ep.rank();
    let mut comm = Some(ep);
    let mut summaries = Vec::with_capacity(variants.len());

    for config in variants {
        let strategy = config.strategy;
        let ep = comm
            .take()
            .ok_or_else(|| anyhow!("rank {rank}: communicator lost"))?;
        let start = Instant::now();
        let mut index = DistributedIndex::new(ep, config.clone())?;

        let stats = index
            .build(&settings.input, settings.threads, settings.chunk_size)
            .with_context(|| format!("rank {rank}: failed to build {}", settings.input.display()))?;
        info!("  rank {}: {} local size after build: {}", rank, strategy, index.local_size());

        index
            .finalize()
            .with_context(|| format!("rank {rank}: finalize of {strategy} index failed"))?;
        let elapsed = start.elapsed();
        info!("  rank {}: {} local size after finalize: {}", rank, strategy, index.local_size());

        if settings.dump {
            dump_entries(&index)?;
        }

        summaries.push(VariantSummary {
            keys: index.local_size(),
            stats,
            elapsed,
        });
        comm = index.into_communicator();
    }
    Ok(summaries)
}

/// Print every local entry as `Entry: key=<k-mer> value=<payload>`
fn dump_entries<C: Communicator>(index: &DistributedIndex<C>) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let encoder = index.encoder();
    for (key, payload) in index.iter()? {
        writeln!(out, "Entry: key={} value={}", encoder.decode(key), payload)?;
    }
    out.flush()?;
    Ok(())
}
