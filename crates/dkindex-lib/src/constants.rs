//! Constants and defaults for the distributed index
//!
//! Compile-time limits, default tuning parameters and the host page size
//! lookup used as the default chunk size.

/// Width of a packed k-mer key in bits
pub const KEY_BITS: usize = 64;

/// Default k-mer length (the benchmark driver indexes 21-mers)
pub const DEFAULT_K: usize = 21;

/// Default seed for the partition hash (must match on every process)
pub const DEFAULT_PARTITION_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Chunk size used when the host page size cannot be queried
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Distinct keys a worker accumulates before draining to the exchange
pub const DEFAULT_ACCUMULATOR_CAPACITY: usize = 1 << 16;

/// Buffered pairs per destination before a send is issued
pub const DEFAULT_SEND_BATCH_SIZE: usize = 8192;

/// Maximum age of a non-empty send buffer, in milliseconds
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;

/// Capacity (in batches) of the worker → communication thread queue
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Look-ahead bound when searching for a record boundary
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1 << 20;

/// Capacity (in frames) of each in-process mailbox
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Offset added to raw quality bytes (Phred+33)
pub const PHRED_OFFSET: u8 = 33;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Host memory page size in bytes
///
/// Queried once per call via `sysconf`; falls back to [`FALLBACK_PAGE_SIZE`]
/// on non-unix targets or when the query fails.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions and only reads process state.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

/// Resolve a chunk size argument (0 = host page size)
#[inline]
pub fn effective_chunk_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        page_size()
    } else {
        chunk_size
    }
}
