//! Sequence file ingestion
//!
//! [`chunk`] cuts a memory-mapped FASTA/FASTQ file into record-aligned byte
//! ranges; [`record`] turns one range into a lazy stream of records.
//! Both rely on the boundary rules in this module.

pub mod chunk;
pub mod record;

pub use chunk::ChunkReader;
pub use record::{Record, RecordError, RecordParser};

use std::fmt;

/// Record-oriented text formats understood by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceFormat {
    /// `@id`, bases, `+`, qualities
    Fastq,
    /// `>id`, one or more lines of bases
    Fasta,
}

impl SequenceFormat {
    /// Detect the format from the first non-whitespace byte
    pub fn detect(data: &[u8]) -> Option<Self> {
        match data.iter().find(|b| !b.is_ascii_whitespace())? {
            b'@' => Some(SequenceFormat::Fastq),
            b'>' => Some(SequenceFormat::Fasta),
            _ => None,
        }
    }

    /// Whether records of this format carry quality strings
    #[inline]
    pub fn has_quality(self) -> bool {
        matches!(self, SequenceFormat::Fastq)
    }

    /// First byte of a record header line
    #[inline]
    pub fn marker(self) -> u8 {
        match self {
            SequenceFormat::Fastq => b'@',
            SequenceFormat::Fasta => b'>',
        }
    }
}

impl fmt::Display for SequenceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceFormat::Fastq => f.write_str("FASTQ"),
            SequenceFormat::Fasta => f.write_str("FASTA"),
        }
    }
}

/// Split off the line starting at `pos`
///
/// Returns the line without its terminator (`\n` or `\r\n`) and the index
/// of the next line, or `None` at end of data.
#[inline]
pub(crate) fn next_line(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    if pos >= data.len() {
        return None;
    }
    let rest = &data[pos..];
    let (line, next) = match rest.iter().position(|&b| b == b'\n') {
        Some(nl) => (&rest[..nl], pos + nl + 1),
        None => (rest, data.len()),
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, next))
}

/// Whether a record header starts at line start `pos`
///
/// FASTQ headers begin with `@`, but so may quality lines; a header is only
/// accepted when the line two below it is a `+` separator.
pub(crate) fn is_record_start(format: SequenceFormat, data: &[u8], pos: usize) -> bool {
    if data.get(pos) != Some(&format.marker()) {
        return false;
    }
    match format {
        SequenceFormat::Fasta => true,
        SequenceFormat::Fastq => {
            let Some((_, seq_pos)) = next_line(data, pos) else {
                return false;
            };
            let Some((_, plus_pos)) = next_line(data, seq_pos) else {
                return false;
            };
            data.get(plus_pos) == Some(&b'+')
        }
    }
}

/// First record start at a line start in `from..limit`
///
/// Candidates are positions at index 0 or right after a newline.
pub(crate) fn find_record_start(
    format: SequenceFormat,
    data: &[u8],
    from: usize,
    limit: usize,
) -> Option<usize> {
    let limit = limit.min(data.len());
    let mut pos = from;
    if pos > 0 && pos < limit && data[pos - 1] != b'\n' {
        pos = match data[pos..limit].iter().position(|&b| b == b'\n') {
            Some(nl) => pos + nl + 1,
            None => return None,
        };
    }
    while pos < limit {
        if is_record_start(format, data, pos) {
            return Some(pos);
        }
        pos = match data[pos..limit].iter().position(|&b| b == b'\n') {
            Some(nl) => pos + nl + 1,
            None => return None,
        };
    }
    None
}
