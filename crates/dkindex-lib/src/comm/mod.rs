//! Message-passing substrate used by the exchange
//!
//! The index never bootstraps processes itself. It is handed a
//! [`Communicator`] (rank, size, point-to-point frames, one collective) and
//! calls it from a single thread only. [`local::LocalCluster`] provides an
//! in-process implementation where each "process" is a thread.

pub mod local;
pub mod wire;

pub use local::{Endpoint, LocalCluster};
pub use wire::Frame;

use std::time::Duration;

/// Thread-safety level a substrate guarantees, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadLevel {
    /// Only one thread may exist
    Single,
    /// Many threads, but only one makes communication calls
    Funneled,
    /// Any thread, one at a time
    Serialized,
    /// Any thread, concurrently
    Multiple,
}

/// Outcome of a failed [`Communicator::send`]
#[derive(Debug)]
pub enum SendError {
    /// The destination cannot take more data right now; retry later
    Full(Vec<u8>),
    /// The destination is gone
    Disconnected,
}

/// Point-to-point and collective operations the exchange relies on
///
/// Frames between one sender and one receiver must be delivered in the
/// order they were sent.
pub trait Communicator: Send + 'static {
    /// Rank of this process, `0..size()`
    fn rank(&self) -> usize;

    /// Number of participating processes
    fn size(&self) -> usize;

    /// Thread-safety guarantee of the substrate
    fn thread_level(&self) -> ThreadLevel;

    /// Queue `frame` for delivery to `dest` without blocking
    fn send(&self, dest: usize, frame: Vec<u8>) -> Result<(), SendError>;

    /// Next delivered frame as `(source, bytes)`, if any
    fn try_recv(&self) -> Option<(usize, Vec<u8>)>;

    /// Wait up to `timeout` for the next delivered frame
    fn recv_timeout(&self, timeout: Duration) -> Option<(usize, Vec<u8>)>;

    /// Barrier that also ANDs one flag across all processes
    ///
    /// Returns only once every process has called it, with `true` iff
    /// every process passed `true`.
    fn agree(&self, ok: bool) -> bool;
}
