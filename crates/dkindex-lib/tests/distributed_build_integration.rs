//! Integration tests for distributed index construction
//!
//! Each test runs a `LocalCluster`, one thread per rank, through the full
//! build → finalize pipeline and checks the union of the local indices.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::thread;

use dkindex_lib::payload::global_offset;
use dkindex_lib::{
    BuildStats, Communicator, DistributedIndex, IndexConfig, IndexError, IndexState, KmerEncoder,
    LocalCluster, MergeStrategy, Partitioner, Payload,
};
use tempfile::NamedTempFile;

fn write_file(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

struct RankResult {
    rank: usize,
    entries: Vec<(u64, Payload)>,
    stats: BuildStats,
}

/// Build `paths` on `nprocs` ranks and return every rank's finalized entries
fn run_cluster(
    nprocs: usize,
    config: IndexConfig,
    paths: Vec<PathBuf>,
    threads: usize,
    chunk_size: usize,
) -> Vec<RankResult> {
    let handles: Vec<_> = LocalCluster::new(nprocs)
        .into_iter()
        .map(|ep| {
            let config = config.clone();
            let paths = paths.clone();
            thread::spawn(move || {
                let mut index = DistributedIndex::new(ep, config).unwrap();
                for path in &paths {
                    index.build(path, threads, chunk_size).unwrap();
                }
                index.finalize().unwrap();
                RankResult {
                    rank: index.rank(),
                    entries: index.iter().unwrap().map(|(k, p)| (k, p.clone())).collect(),
                    stats: index.build_stats(),
                }
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Union of all ranks, asserting no key is held twice and owners are right
fn union(results: &[RankResult], config: &IndexConfig) -> BTreeMap<u64, Payload> {
    let partitioner = Partitioner::new(results.len(), config.partition_seed);
    let mut all = BTreeMap::new();
    for result in results {
        for (key, payload) in &result.entries {
            assert_eq!(partitioner.owner(*key), result.rank, "key {key} on wrong rank");
            assert!(all.insert(*key, payload.clone()).is_none(), "key {key} held twice");
        }
    }
    all
}

fn decoded(all: &BTreeMap<u64, Payload>, config: &IndexConfig) -> BTreeMap<String, Payload> {
    let encoder = KmerEncoder::new(config.k, config.alphabet, config.canonical).unwrap();
    all.iter().map(|(k, p)| (encoder.decode(*k), p.clone())).collect()
}

/// Deterministic pseudo-random reads; returns file contents and
/// `(offset of first base, bases)` per record
fn synthetic_fastq(reads: usize, len: usize, seed: u64) -> (String, Vec<(u64, String)>) {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as usize
    };
    let mut out = String::new();
    let mut records = Vec::new();
    for i in 0..reads {
        out.push_str(&format!("@read{i}\n"));
        let seq: String = (0..len)
            .map(|_| match next() % 41 {
                0 => 'N',
                r => b"ACGT"[r % 4] as char,
            })
            .collect();
        records.push((out.len() as u64, seq.clone()));
        out.push_str(&seq);
        out.push_str("\n+\n");
        out.extend((0..len).map(|_| (b'!' + (next() % 41) as u8) as char));
        out.push('\n');
    }
    (out, records)
}

#[test]
fn test_count_scenario_single_and_multi_process() {
    let f = write_file(">r\nACGTACG\n");
    let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
    let expected: BTreeMap<String, Payload> = [
        ("ACG", 2),
        ("CGT", 1),
        ("GTA", 1),
        ("TAC", 1),
    ]
    .into_iter()
    .map(|(s, c)| (s.to_string(), Payload::Count(c)))
    .collect();

    for nprocs in [1, 3] {
        let results = run_cluster(nprocs, config.clone(), vec![f.path().to_path_buf()], 1, 0);
        assert_eq!(decoded(&union(&results, &config), &config), expected);
    }
}

#[test]
fn test_windows_with_unknown_symbols_are_skipped() {
    let f = write_file(">r\nACNGTAC\n");
    let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
    let results = run_cluster(1, config.clone(), vec![f.path().to_path_buf()], 1, 0);

    let got = decoded(&union(&results, &config), &config);
    let expected: BTreeMap<String, Payload> = [("GTA", 1), ("TAC", 1)]
        .into_iter()
        .map(|(s, c)| (s.to_string(), Payload::Count(c)))
        .collect();
    assert_eq!(got, expected);
    assert_eq!(results[0].stats.skipped_windows, 3);
    assert_eq!(results[0].stats.kmers, 2);
}

#[test]
fn test_canonical_pairs_meet_on_one_process() {
    let f = write_file(">a\nAAC\n>b\nGTT\n");
    let config = IndexConfig {
        canonical: true,
        ..IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap()
    };
    let results = run_cluster(2, config.clone(), vec![f.path().to_path_buf()], 1, 0);
    let all = union(&results, &config);
    assert_eq!(decoded(&all, &config), BTreeMap::from([("AAC".to_string(), Payload::Count(2))]));

    let holders = results.iter().filter(|r| !r.entries.is_empty()).count();
    assert_eq!(holders, 1);
}

#[test]
fn test_counts_match_needletail_reference() {
    let (contents, _) = synthetic_fastq(300, 80, 7);
    let f = write_file(&contents);
    let config = IndexConfig {
        accumulator_capacity: 64,
        send_batch_size: 16,
        queue_depth: 2,
        ..IndexConfig::new(11, MergeStrategy::IncrementCount).unwrap()
    };

    let encoder = KmerEncoder::new(config.k, config.alphabet, config.canonical).unwrap();
    let mut expected: BTreeMap<u64, Payload> = BTreeMap::new();
    let mut records = 0u64;
    let mut reader = needletail::parse_fastx_file(f.path()).unwrap();
    while let Some(record) = reader.next() {
        let record = record.unwrap();
        records += 1;
        for (key, _) in encoder.windows(&record.seq()) {
            expected
                .entry(key)
                .and_modify(|p| p.merge(Payload::Count(1)))
                .or_insert(Payload::Count(1));
        }
    }

    for nprocs in [1, 2, 4] {
        let results = run_cluster(nprocs, config.clone(), vec![f.path().to_path_buf()], 2, 256);
        assert_eq!(union(&results, &config), expected, "nprocs={nprocs}");
        let seen: u64 = results.iter().map(|r| r.stats.records).sum();
        assert_eq!(seen, records);
        assert!(results.iter().all(|r| r.stats.malformed_records == 0));
    }
}

#[test]
fn test_positions_are_complete() {
    let (contents, records) = synthetic_fastq(120, 60, 42);
    let f = write_file(&contents);
    let config = IndexConfig::new(9, MergeStrategy::AppendPosition).unwrap();
    let encoder = KmerEncoder::new(config.k, config.alphabet, config.canonical).unwrap();

    let mut expected: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    for (offset, seq) in &records {
        for (key, window) in encoder.windows(seq.as_bytes()) {
            expected.entry(key).or_default().push(global_offset(0, offset + window as u64));
        }
    }
    let expected: BTreeMap<u64, Payload> = expected
        .into_iter()
        .map(|(k, mut v)| {
            v.sort_unstable();
            (k, Payload::Positions(v))
        })
        .collect();

    let results = run_cluster(3, config.clone(), vec![f.path().to_path_buf()], 3, 200);
    assert_eq!(union(&results, &config), expected);
}

#[test]
fn test_best_quality_occurrence_wins() {
    let f = write_file("@a\nACG\n+\n!!!\n@b\nACG\n+\nIII\n@c\nACG\n+\n555\n");
    let config = IndexConfig::new(3, MergeStrategy::BestQuality).unwrap();
    let results = run_cluster(2, config.clone(), vec![f.path().to_path_buf()], 1, 0);
    let all = decoded(&union(&results, &config), &config);

    match all.get("ACG") {
        Some(Payload::PositionQuality { position, quality }) => {
            assert_eq!(*position, 16);
            let expected = (1.0f64 - 1e-4).powi(3) as f32;
            assert!((quality - expected).abs() < 1e-6);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_malformed_records_are_counted_not_fatal() {
    let f = write_file("@ok1\nACGT\n+\nIIII\n@bad\nACGT\n+\nII\n@ok2\nTTTT\n+\nIIII\n");
    let config = IndexConfig::new(4, MergeStrategy::IncrementCount).unwrap();
    let results = run_cluster(1, config.clone(), vec![f.path().to_path_buf()], 1, 0);
    assert_eq!(results[0].stats.malformed_records, 1);
    assert_eq!(results[0].stats.records, 2);

    let got = decoded(&union(&results, &config), &config);
    assert_eq!(got.len(), 2);
    assert_eq!(got["ACGT"], Payload::Count(1));
    assert_eq!(got["TTTT"], Payload::Count(1));
}

#[test]
fn test_missing_separator_skipped_under_any_schedule() {
    let f = write_file(concat!(
        "@ok\nACGTAC\n+\nIIIIII\n",
        "@bad\nACGTTT\nIIIIII\n",
        "@mid\nGGCATG\n+\nIIIIII\n",
        "@end\nTTTACG\n+\nIIIIII\n",
    ));
    let config = IndexConfig::new(4, MergeStrategy::IncrementCount).unwrap();

    let mut expected: BTreeMap<String, Payload> = BTreeMap::new();
    for seq in ["ACGTAC", "GGCATG", "TTTACG"] {
        for i in 0..=seq.len() - 4 {
            expected
                .entry(seq[i..i + 4].to_string())
                .and_modify(|p| p.merge(Payload::Count(1)))
                .or_insert(Payload::Count(1));
        }
    }

    for nprocs in [1, 2, 3] {
        for threads in [1, 3] {
            for chunk_size in [0, 16, 31, 64] {
                let results = run_cluster(
                    nprocs,
                    config.clone(),
                    vec![f.path().to_path_buf()],
                    threads,
                    chunk_size,
                );
                let schedule = format!("procs={nprocs} threads={threads} chunk={chunk_size}");
                let malformed: u64 = results.iter().map(|r| r.stats.malformed_records).sum();
                let records: u64 = results.iter().map(|r| r.stats.records).sum();
                assert_eq!(malformed, 1, "{schedule}");
                assert_eq!(records, 3, "{schedule}");
                assert_eq!(decoded(&union(&results, &config), &config), expected, "{schedule}");
            }
        }
    }
}

#[test]
fn test_multiline_fasta_and_rna() {
    let f = write_file(">r1\nACG\nUAC\n\n>r2\nacgu\n");
    let config = IndexConfig {
        alphabet: dkindex_lib::Alphabet::Rna,
        ..IndexConfig::new(4, MergeStrategy::IncrementCount).unwrap()
    };
    let results = run_cluster(2, config.clone(), vec![f.path().to_path_buf()], 2, 0);
    let got = decoded(&union(&results, &config), &config);
    let expected: BTreeMap<String, Payload> = [("ACGU", 2), ("CGUA", 1), ("GUAC", 1)]
        .into_iter()
        .map(|(s, c)| (s.to_string(), Payload::Count(c)))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn test_several_files_accumulate() {
    let first = write_file(">a\nACGTACG\n");
    let second = write_file("@b\nACG\n+\nIII\n");
    let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
    let results = run_cluster(
        2,
        config.clone(),
        vec![first.path().to_path_buf(), second.path().to_path_buf()],
        1,
        0,
    );
    let got = decoded(&union(&results, &config), &config);
    assert_eq!(got["ACG"], Payload::Count(3));
}

#[test]
fn test_empty_input_finalizes_empty() {
    let f = write_file("");
    let config = IndexConfig::default();
    let results = run_cluster(2, config.clone(), vec![f.path().to_path_buf()], 0, 0);
    assert!(union(&results, &config).is_empty());
}

#[test]
fn test_iteration_is_restartable() {
    let f = write_file(">r\nACGTTGCAACGT\n");
    let config = IndexConfig::new(5, MergeStrategy::AppendPosition).unwrap();
    let mut index = DistributedIndex::new(LocalCluster::new(1).remove(0), config).unwrap();
    index.build(f.path(), 2, 0).unwrap();
    index.finalize().unwrap();

    let first: HashMap<u64, Payload> = index.iter().unwrap().map(|(k, p)| (k, p.clone())).collect();
    let second: HashMap<u64, Payload> = index.iter().unwrap().map(|(k, p)| (k, p.clone())).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), index.local_size());
    assert_eq!(index.local_index().unwrap().len(), first.len());
}

#[test]
fn test_build_failure_aborts_every_process() {
    let good = write_file(">r\nACGTACG\n");
    let good_path = good.path().to_path_buf();
    let handles: Vec<_> = LocalCluster::new(2)
        .into_iter()
        .map(|ep| {
            let good_path = good_path.clone();
            thread::spawn(move || {
                let rank = ep.rank();
                let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
                let mut index = DistributedIndex::new(ep, config).unwrap();
                if rank == 0 {
                    assert!(index.build("/no/such/input.fa", 1, 0).is_err());
                } else {
                    index.build(&good_path, 1, 0).unwrap();
                }
                let result = index.finalize();
                (result, index.state())
            })
        })
        .collect();

    for handle in handles {
        let (result, state) = handle.join().unwrap();
        assert!(matches!(result, Err(IndexError::Aborted { .. })));
        assert_eq!(state, IndexState::Aborted);
    }
}

#[test]
fn test_dropped_index_releases_peers() {
    let f = write_file(">r\nACGTACG\n");
    let path = f.path().to_path_buf();
    let mut endpoints = LocalCluster::new(2);
    let peer = endpoints.pop().unwrap();
    let mine = endpoints.pop().unwrap();

    let waiting = thread::spawn(move || {
        let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
        let mut index = DistributedIndex::new(peer, config).unwrap();
        index.build(&path, 1, 0).unwrap();
        index.finalize()
    });

    let config = IndexConfig::new(3, MergeStrategy::IncrementCount).unwrap();
    let mut index = DistributedIndex::new(mine, config).unwrap();
    index.build(f.path(), 1, 0).unwrap();
    drop(index);

    assert!(matches!(waiting.join().unwrap(), Err(IndexError::Aborted { .. })));
}

#[test]
fn test_owned_keys_are_disjoint_across_many_ranks() {
    let (contents, _) = synthetic_fastq(200, 50, 3);
    let f = write_file(&contents);
    let config = IndexConfig {
        canonical: true,
        ..IndexConfig::new(7, MergeStrategy::IncrementCount).unwrap()
    };
    let results = run_cluster(5, config.clone(), vec![f.path().to_path_buf()], 2, 512);
    let all = union(&results, &config);

    let encoder = KmerEncoder::new(config.k, config.alphabet, true).unwrap();
    let keys: HashSet<u64> = all.keys().copied().collect();
    for key in &keys {
        assert_eq!(encoder.canonical(*key), *key);
    }
    let total: u64 = all.values().map(Payload::occurrences).sum();
    let kmers: u64 = results.iter().map(|r| r.stats.kmers).sum();
    assert_eq!(total, kmers);
}
