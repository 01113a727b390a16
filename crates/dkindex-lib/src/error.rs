//! Error type shared by every stage of the index build
//!
//! Fatal setup errors, collective failures and state misuse surface as
//! [`IndexError`]. Record-level problems never do: they are counted in
//! [`BuildStats`](crate::index::BuildStats) and logged.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by index construction, `build` and `finalize`
#[derive(Error, Debug)]
pub enum IndexError {
    /// The input file could not be opened or mapped
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The input is not a recognised sequence format
    #[error("unrecognised sequence format in {}: {detail}", path.display())]
    Format {
        /// File being read
        path: PathBuf,
        /// What was found instead
        detail: String,
    },

    /// A byte range could not be decoded at all
    #[error("malformed input at byte {offset}: {detail}")]
    Malformed {
        /// Absolute file offset where decoding failed
        offset: u64,
        /// Description of the problem
        detail: String,
    },

    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The message-passing substrate lacks funneled thread support
    #[error("communicator provides {provided:?} thread support, {required:?} is required")]
    ThreadSupport {
        /// Level reported by the substrate
        provided: crate::comm::ThreadLevel,
        /// Minimum level the exchange needs
        required: crate::comm::ThreadLevel,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("cannot {operation} while index is {state:?}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the index was in
        state: crate::index::IndexState,
    },

    /// A frame received from a peer could not be decoded
    #[error("protocol error from rank {source_rank}: {detail}")]
    Protocol {
        /// Sending rank
        source_rank: usize,
        /// Description of the framing problem
        detail: String,
    },

    /// The distributed build was aborted by at least one process
    #[error("distributed index aborted (observed on rank {rank})")]
    Aborted {
        /// Rank that observed the abort
        rank: usize,
    },

    /// The rayon worker pool could not be created
    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),

    /// The communication thread went away unexpectedly
    #[error("exchange channel disconnected")]
    Disconnected,
}

impl IndexError {
    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IndexError>;
