//! Routing of (key, payload) pairs to the process that owns each key
//!
//! Worker threads never touch the [`Communicator`]. They push batches into a
//! bounded queue ([`ExchangeSender`]); one communication thread per process
//! drains that queue, buffers pairs per destination, sends frames, merges
//! whatever peers send back into the local index, and finally runs the
//! termination protocol:
//!
//! 1. flush every send buffer
//! 2. send `Done` (or `Abort`) to every peer
//! 3. keep merging until every peer's `Done`/`Abort` has arrived
//! 4. `agree` on the outcome
//!
//! Frames from one peer arrive in order, so once its end marker is seen no
//! more of its pairs are in flight. The local index lives on the
//! communication thread only and needs no lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::accumulator::Batch;
use crate::comm::wire::{self, Frame};
use crate::comm::{Communicator, SendError, ThreadLevel};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::payload::{MergeStrategy, Payload};

/// Keys owned by this process with their merged payloads
pub type LocalIndex = HashMap<u64, Payload, RandomState>;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Command {
    Batch { owner: usize, pairs: Batch },
    Finish { ok: bool },
}

/// Counters kept by the communication thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Frames delivered to the substrate
    pub frames_sent: u64,
    /// Pairs sent to other processes
    pub pairs_sent: u64,
    /// Pairs received from other processes
    pub pairs_received: u64,
    /// Pairs that stayed on this process
    pub pairs_kept: u64,
    /// Sends the substrate refused because the destination was full
    pub send_retries: u64,
}

/// Producer handle onto the exchange queue
///
/// Cloneable; one per worker. Sending blocks while the queue is full.
#[derive(Clone)]
pub struct ExchangeSender {
    tx: Sender<Command>,
}

impl ExchangeSender {
    /// Queue `pairs` for delivery to process `owner`
    ///
    /// # Errors
    /// [`IndexError::Disconnected`] if the communication thread has stopped.
    pub fn send(&self, owner: usize, pairs: Batch) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Command::Batch { owner, pairs })
            .map_err(|_| IndexError::Disconnected)
    }
}

/// Result of [`Exchange::finish`]
pub type Finished<C> = (Option<C>, Result<(LocalIndex, ExchangeStats)>);

/// Handle onto one process's communication thread
pub struct Exchange<C: Communicator> {
    rank: usize,
    tx: Sender<Command>,
    handle: Option<JoinHandle<(C, Result<(LocalIndex, ExchangeStats)>)>>,
    local_size: Arc<AtomicUsize>,
}

impl<C: Communicator> Exchange<C> {
    /// Spawn the communication thread, which takes ownership of `comm`
    ///
    /// # Errors
    /// - [`IndexError::ThreadSupport`] if `comm` is below [`ThreadLevel::Funneled`]
    /// - [`IndexError::ThreadPool`] if the thread cannot be spawned
    pub fn start(comm: C, config: &IndexConfig) -> Result<Self> {
        let provided = comm.thread_level();
        if provided < ThreadLevel::Funneled {
            return Err(IndexError::ThreadSupport {
                provided,
                required: ThreadLevel::Funneled,
            });
        }

        let rank = comm.rank();
        let (tx, rx) = bounded(config.queue_depth.max(1));
        let local_size = Arc::new(AtomicUsize::new(0));
        let pump = Pump::new(comm, config, Arc::clone(&local_size));

        let handle = std::thread::Builder::new()
            .name(format!("dkindex-comm-{rank}"))
            .spawn(move || pump.run(rx))
            .map_err(|e| IndexError::ThreadPool(format!("communication thread: {e}")))?;

        Ok(Self {
            rank,
            tx,
            handle: Some(handle),
            local_size,
        })
    }

    /// Rank of this process
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// New producer handle
    pub fn sender(&self) -> ExchangeSender {
        ExchangeSender { tx: self.tx.clone() }
    }

    /// Keys currently held by the local index
    pub fn local_size(&self) -> usize {
        self.local_size.load(Ordering::Relaxed)
    }

    /// Run the termination protocol and stop the communication thread
    ///
    /// `ok == false` announces an abort to every peer. Returns the
    /// communicator (unless the thread died) and either the finished local
    /// index or the reason the collective build failed.
    pub fn finish(mut self, ok: bool) -> Finished<C> {
        self.shutdown(ok)
    }

    fn shutdown(&mut self, ok: bool) -> Finished<C> {
        let Some(handle) = self.handle.take() else {
            return (None, Err(IndexError::Disconnected));
        };
        // the thread may already be winding down after an internal error
        let _ = self.tx.send(Command::Finish { ok });
        match handle.join() {
            Ok((comm, result)) => (Some(comm), result),
            Err(_) => (None, Err(IndexError::Disconnected)),
        }
    }
}

impl<C: Communicator> Drop for Exchange<C> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(rank = self.rank, "exchange dropped without finish; aborting");
            let _ = self.shutdown(false);
        }
    }
}

/// State owned by the communication thread
struct Pump<C> {
    comm: C,
    rank: usize,
    nprocs: usize,
    strategy: MergeStrategy,
    send_batch_size: usize,
    flush_interval: Duration,
    index: LocalIndex,
    local_size: Arc<AtomicUsize>,
    buffers: Vec<Batch>,
    buffered_since: Vec<Option<Instant>>,
    pending: Vec<VecDeque<Vec<u8>>>,
    ended: Vec<bool>,
    peer_aborted: bool,
    stats: ExchangeStats,
}

impl<C: Communicator> Pump<C> {
    fn new(comm: C, config: &IndexConfig, local_size: Arc<AtomicUsize>) -> Self {
        let rank = comm.rank();
        let nprocs = comm.size();
        let mut ended = vec![false; nprocs];
        ended[rank] = true;
        Self {
            comm,
            rank,
            nprocs,
            strategy: config.strategy,
            send_batch_size: config.send_batch_size.max(1),
            flush_interval: config.flush_interval,
            index: LocalIndex::default(),
            local_size,
            buffers: vec![Vec::new(); nprocs],
            buffered_since: vec![None; nprocs],
            pending: vec![VecDeque::new(); nprocs],
            ended,
            peer_aborted: false,
            stats: ExchangeStats::default(),
        }
    }

    fn run(mut self, rx: Receiver<Command>) -> (C, Result<(LocalIndex, ExchangeStats)>) {
        let mut failure = None;
        let ok = match self.pump(&rx) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(rank = self.rank, error = %e, "exchange failed; aborting");
                failure = Some(e);
                false
            }
        };
        drop(rx);

        debug!(rank = self.rank, phase = "terminate", ok, "sending end markers");
        if let Err(e) = self.close(ok) {
            failure.get_or_insert(e);
        }

        let local_ok = ok && failure.is_none();
        let all_ok = self.comm.agree(local_ok && !self.peer_aborted);
        let Pump {
            comm,
            rank,
            mut index,
            stats,
            ..
        } = self;

        if let Some(e) = failure {
            return (comm, Err(e));
        }
        if !all_ok {
            info!(rank, "distributed build aborted");
            return (comm, Err(IndexError::Aborted { rank }));
        }

        for payload in index.values_mut() {
            payload.normalize();
        }
        info!(
            rank,
            phase = "finalize",
            keys = index.len(),
            frames_sent = stats.frames_sent,
            pairs_sent = stats.pairs_sent,
            pairs_received = stats.pairs_received,
            pairs_kept = stats.pairs_kept,
            send_retries = stats.send_retries,
            "local index complete"
        );
        (comm, Ok((index, stats)))
    }

    /// Serve the queue until `Finish`; returns the producer's verdict
    fn pump(&mut self, rx: &Receiver<Command>) -> Result<bool> {
        loop {
            self.drain_incoming()?;
            self.retry_pending()?;
            if self.has_pending() {
                // stop taking work until peers make room, but keep draining
                if let Some((source, frame)) = self.comm.recv_timeout(POLL_INTERVAL) {
                    self.receive(source, &frame)?;
                }
                continue;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Command::Batch { owner, pairs }) => self.route(owner, pairs)?,
                Ok(Command::Finish { ok }) => return Ok(ok),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(false),
            }
            self.flush_aged()?;
        }
    }

    /// Flush, announce the end of stream and wait for every peer's marker
    fn close(&mut self, ok: bool) -> Result<()> {
        let mut failure = None;
        if ok {
            for dest in 0..self.nprocs {
                if let Err(e) = self.flush(dest) {
                    failure.get_or_insert(e);
                }
            }
        } else {
            self.buffers.iter_mut().for_each(Vec::clear);
        }

        let marker = if ok { wire::encode_done() } else { wire::encode_abort() };
        let rank = self.rank;
        for dest in (0..self.nprocs).filter(|&d| d != rank) {
            self.enqueue(dest, marker.clone())?;
        }

        while self.has_pending() || self.ended.iter().any(|e| !e) {
            self.retry_pending()?;
            if let Some((source, frame)) = self.comm.recv_timeout(POLL_INTERVAL) {
                if let Err(e) = self.receive(source, &frame) {
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn drain_incoming(&mut self) -> Result<()> {
        while let Some((source, frame)) = self.comm.try_recv() {
            self.receive(source, &frame)?;
        }
        Ok(())
    }

    fn receive(&mut self, source: usize, frame: &[u8]) -> Result<()> {
        let protocol = |detail: String| IndexError::Protocol {
            source_rank: source,
            detail,
        };
        if source >= self.nprocs {
            return Err(protocol(format!("unknown source rank (size {})", self.nprocs)));
        }
        match wire::decode(self.strategy, frame).map_err(protocol)? {
            Frame::Pairs(pairs) => {
                if self.ended[source] {
                    return Err(protocol("pairs received after end of stream".into()));
                }
                self.stats.pairs_received += pairs.len() as u64;
                self.merge(pairs);
            }
            Frame::Done => self.ended[source] = true,
            Frame::Abort => {
                warn!(rank = self.rank, peer = source, "peer aborted");
                self.ended[source] = true;
                self.peer_aborted = true;
            }
        }
        Ok(())
    }

    fn merge(&mut self, pairs: Batch) {
        for (key, payload) in pairs {
            match self.index.entry(key) {
                std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(payload),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(payload);
                }
            }
        }
        self.local_size.store(self.index.len(), Ordering::Relaxed);
    }

    fn route(&mut self, owner: usize, pairs: Batch) -> Result<()> {
        if owner == self.rank {
            self.stats.pairs_kept += pairs.len() as u64;
            self.merge(pairs);
            return Ok(());
        }
        let buffer = &mut self.buffers[owner];
        buffer.extend(pairs);
        if buffer.len() >= self.send_batch_size {
            self.flush(owner)
        } else {
            self.buffered_since[owner].get_or_insert_with(Instant::now);
            Ok(())
        }
    }

    fn flush_aged(&mut self) -> Result<()> {
        let now = Instant::now();
        for dest in 0..self.nprocs {
            if let Some(since) = self.buffered_since[dest] {
                if now.duration_since(since) >= self.flush_interval {
                    self.flush(dest)?;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self, dest: usize) -> Result<()> {
        self.buffered_since[dest] = None;
        if self.buffers[dest].is_empty() {
            return Ok(());
        }
        let pairs = std::mem::take(&mut self.buffers[dest]);
        self.stats.pairs_sent += pairs.len() as u64;
        let frame = wire::encode_pairs(self.strategy, &pairs);
        self.enqueue(dest, frame)
    }

    /// Send now if nothing is queued for `dest`, otherwise queue behind it
    fn enqueue(&mut self, dest: usize, frame: Vec<u8>) -> Result<()> {
        if !self.pending[dest].is_empty() {
            self.pending[dest].push_back(frame);
            return Ok(());
        }
        match self.comm.send(dest, frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                Ok(())
            }
            Err(SendError::Full(frame)) => {
                self.stats.send_retries += 1;
                self.pending[dest].push_back(frame);
                Ok(())
            }
            Err(SendError::Disconnected) => Err(IndexError::Disconnected),
        }
    }

    fn retry_pending(&mut self) -> Result<()> {
        for dest in 0..self.nprocs {
            while let Some(frame) = self.pending[dest].pop_front() {
                match self.comm.send(dest, frame) {
                    Ok(()) => self.stats.frames_sent += 1,
                    Err(SendError::Full(frame)) => {
                        self.stats.send_retries += 1;
                        self.pending[dest].push_front(frame);
                        break;
                    }
                    Err(SendError::Disconnected) => return Err(IndexError::Disconnected),
                }
            }
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.pending.iter().any(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use crate::partition::Partitioner;
    use std::thread;

    fn tiny_config(strategy: MergeStrategy) -> IndexConfig {
        IndexConfig {
            strategy,
            send_batch_size: 1,
            queue_depth: 1,
            flush_interval: Duration::from_millis(1),
            ..IndexConfig::default()
        }
    }

    #[test]
    fn test_single_process_merges_locally() {
        let mut endpoints = LocalCluster::new(1);
        let config = tiny_config(MergeStrategy::IncrementCount);
        let exchange = Exchange::start(endpoints.remove(0), &config).unwrap();
        let sender = exchange.sender();
        sender.send(0, vec![(1, Payload::Count(2)), (2, Payload::Count(1))]).unwrap();
        sender.send(0, vec![(1, Payload::Count(3))]).unwrap();
        sender.send(0, Vec::new()).unwrap();

        let (comm, result) = exchange.finish(true);
        assert!(comm.is_some());
        let (index, stats) = result.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[&1], Payload::Count(5));
        assert_eq!(index[&2], Payload::Count(1));
        assert_eq!(stats.pairs_kept, 3);
        assert_eq!(stats.frames_sent, 0);
    }

    #[test]
    fn test_pairs_reach_their_owner_under_back_pressure() {
        let nprocs = 3;
        let endpoints = LocalCluster::with_capacity(nprocs, 1);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let partitioner = Partitioner::new(nprocs, IndexConfig::default().partition_seed);
                    let rank = ep.rank();
                    let exchange =
                        Exchange::start(ep, &tiny_config(MergeStrategy::AppendPosition)).unwrap();
                    let sender = exchange.sender();
                    for key in 0..200u64 {
                        let position = rank as u64 * 1000 + key;
                        sender
                            .send(partitioner.owner(key), vec![(key, Payload::Positions(vec![position]))])
                            .unwrap();
                    }
                    let (_, result) = exchange.finish(true);
                    (rank, result.unwrap().0)
                })
            })
            .collect();

        let partitioner = Partitioner::new(nprocs, IndexConfig::default().partition_seed);
        let mut seen = 0;
        for handle in handles {
            let (rank, index) = handle.join().unwrap();
            for (key, payload) in index {
                assert_eq!(partitioner.owner(key), rank);
                assert_eq!(payload, Payload::Positions(vec![key, 1000 + key, 2000 + key]));
                seen += 1;
            }
        }
        assert_eq!(seen, 200);
    }

    #[test]
    fn test_abort_reaches_every_process() {
        let endpoints = LocalCluster::new(2);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let ok = ep.rank() != 0;
                    let exchange = Exchange::start(ep, &tiny_config(MergeStrategy::IncrementCount)).unwrap();
                    exchange.sender().send(1, vec![(7, Payload::Count(1))]).unwrap();
                    exchange.finish(ok)
                })
            })
            .collect();
        for handle in handles {
            let (comm, result) = handle.join().unwrap();
            assert!(comm.is_some());
            assert!(matches!(result, Err(IndexError::Aborted { .. })));
        }
    }

    #[test]
    fn test_dropped_exchange_aborts_peers() {
        let mut endpoints = LocalCluster::new(2);
        let peer = endpoints.pop().unwrap();
        let mine = endpoints.pop().unwrap();
        let config = tiny_config(MergeStrategy::IncrementCount);

        let peer_config = config.clone();
        let waiting = thread::spawn(move || {
            let exchange = Exchange::start(peer, &peer_config).unwrap();
            exchange.finish(true).1
        });
        drop(Exchange::start(mine, &config).unwrap());
        assert!(matches!(waiting.join().unwrap(), Err(IndexError::Aborted { .. })));
    }

    #[test]
    fn test_local_size_tracks_merges() {
        let mut endpoints = LocalCluster::new(1);
        let exchange =
            Exchange::start(endpoints.remove(0), &tiny_config(MergeStrategy::IncrementCount)).unwrap();
        exchange
            .sender()
            .send(0, (0..10u64).map(|k| (k, Payload::Count(1))).collect())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while exchange.local_size() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(exchange.local_size(), 10);
        assert!(exchange.finish(true).1.is_ok());
    }

    struct SingleThreaded;

    impl Communicator for SingleThreaded {
        fn rank(&self) -> usize {
            0
        }
        fn size(&self) -> usize {
            1
        }
        fn thread_level(&self) -> ThreadLevel {
            ThreadLevel::Single
        }
        fn send(&self, _dest: usize, _frame: Vec<u8>) -> std::result::Result<(), SendError> {
            Err(SendError::Disconnected)
        }
        fn try_recv(&self) -> Option<(usize, Vec<u8>)> {
            None
        }
        fn recv_timeout(&self, _timeout: Duration) -> Option<(usize, Vec<u8>)> {
            None
        }
        fn agree(&self, ok: bool) -> bool {
            ok
        }
    }

    #[test]
    fn test_thread_support_is_checked() {
        let err = Exchange::start(SingleThreaded, &IndexConfig::default()).err().unwrap();
        assert!(matches!(
            err,
            IndexError::ThreadSupport {
                provided: ThreadLevel::Single,
                required: ThreadLevel::Funneled
            }
        ));
    }
}
