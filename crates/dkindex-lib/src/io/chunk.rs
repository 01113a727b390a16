//! Record-aligned partitioning of a sequence file
//!
//! The file is memory-mapped once. Each process first takes a contiguous
//! block of it ([`ChunkReader::process_range`]), then cuts that block into
//! chunks of roughly `chunk_size` bytes ([`ChunkReader::chunks`]). Every
//! boundary is moved forward to the next record start, so no record is ever
//! split and adjacent ranges tile the file exactly.

use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use super::{find_record_start, SequenceFormat};
use crate::constants::effective_chunk_size;
use crate::error::{IndexError, Result};

/// Memory-mapped input file that hands out record-aligned byte ranges
pub struct ChunkReader {
    path: PathBuf,
    /// `None` for empty files, which cannot be mapped on every platform
    mmap: Option<Mmap>,
    format: SequenceFormat,
    max_record_bytes: usize,
}

impl ChunkReader {
    /// Open and map `path`
    ///
    /// # Errors
    /// - [`IndexError::Io`] if the file cannot be opened or mapped
    /// - [`IndexError::Format`] if it is neither FASTA nor FASTQ
    pub fn open(path: impl AsRef<Path>, max_record_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| IndexError::io(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| IndexError::io(&path, e))?
            .len();

        if len == 0 {
            return Ok(Self {
                path,
                mmap: None,
                format: SequenceFormat::Fastq,
                max_record_bytes,
            });
        }

        // SAFETY: the mapping is read-only and lives no longer than `self`;
        // the input is not expected to be modified while the index builds.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| IndexError::io(&path, e))?;
        let format = SequenceFormat::detect(&mmap).ok_or_else(|| IndexError::Format {
            path: path.clone(),
            detail: "expected '@' (FASTQ) or '>' (FASTA) as first character".into(),
        })?;

        debug!(path = %path.display(), len, %format, "mapped input");
        Ok(Self {
            path,
            mmap: Some(mmap),
            format,
            max_record_bytes: max_record_bytes.max(1),
        })
    }

    /// Detected record format
    pub fn format(&self) -> SequenceFormat {
        self.format
    }

    /// Entire file contents
    pub fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// File length in bytes
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether the file is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block of the file read by process `rank` out of `nprocs`
    pub fn process_range(&self, rank: usize, nprocs: usize) -> Result<Range<usize>> {
        let len = self.len();
        let nprocs = nprocs.max(1);
        let nominal_start = (len as u128 * rank as u128 / nprocs as u128) as usize;
        let nominal_end = (len as u128 * (rank as u128 + 1) / nprocs as u128) as usize;
        let start = self.align(nominal_start, len)?;
        let end = self.align(nominal_end, len)?;
        Ok(start..end.max(start))
    }

    /// Cut `range` into record-aligned chunks of about `chunk_size` bytes
    ///
    /// `chunk_size == 0` selects the host page size. When that would give
    /// fewer chunks than `threads`, the chunk size shrinks so every thread
    /// receives at least one chunk (as long as there are enough records).
    pub fn chunks(
        &self,
        range: Range<usize>,
        chunk_size: usize,
        threads: usize,
    ) -> Result<Vec<Range<usize>>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let len = range.len();
        let mut size = effective_chunk_size(chunk_size);
        if threads > 1 && len / size < threads {
            size = len.div_ceil(threads).max(1);
        }

        let mut chunks = Vec::with_capacity(len / size + 1);
        let mut start = range.start;
        for nominal in (range.start + size..range.end).step_by(size) {
            let boundary = self.align(nominal, range.end)?;
            if boundary >= range.end {
                break;
            }
            // a long record may cover several nominal points
            if boundary > start {
                chunks.push(start..boundary);
                start = boundary;
            }
        }
        chunks.push(start..range.end);
        Ok(chunks)
    }

    /// Move `pos` forward to the next record start, never past `end`
    fn align(&self, pos: usize, end: usize) -> Result<usize> {
        if pos == 0 || pos >= end {
            return Ok(pos.min(end));
        }
        let limit = pos.saturating_add(self.max_record_bytes).min(end);
        match find_record_start(self.format, self.data(), pos, limit) {
            Some(start) => Ok(start),
            None if limit >= end => Ok(end),
            None => Err(IndexError::Malformed {
                offset: pos as u64,
                detail: format!(
                    "no {} record start within {} bytes in {}",
                    self.format,
                    self.max_record_bytes,
                    self.path.display()
                ),
            }),
        }
    }
}
