//! Lazy FASTA/FASTQ record parsing over one byte range
//!
//! The parser borrows the mapped bytes and yields one record at a time.
//! A malformed record is reported as an error item, after which the parser
//! resynchronises on the next record start and carries on. A range that
//! cannot be decoded at all (it does not begin with a record, or the file
//! itself ends in the middle of a FASTQ record) yields a single fatal item
//! and stops.
//!
//! Ranges handed out by the chunker end at a record start or at end of
//! file. A record cut short by a range that does not reach end of file
//! therefore lacks lines, and is skipped like any other malformed record.

use std::borrow::Cow;

use thiserror::Error;

use super::{find_record_start, next_line, SequenceFormat};

/// One sequence record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    /// Header line without the leading marker
    pub id: &'a [u8],
    /// Bases (joined across lines for wrapped FASTA)
    pub seq: Cow<'a, [u8]>,
    /// Per-base qualities (FASTQ only)
    pub qual: Option<&'a [u8]>,
    /// Absolute file offset of the first base
    pub offset: u64,
}

/// Problems found while parsing a range
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The record at `offset` was skipped
    #[error("malformed record at byte {offset}: {reason}")]
    Malformed {
        /// Absolute file offset of the record header
        offset: u64,
        /// What was wrong with it
        reason: String,
    },
    /// The range cannot be decoded; no further records follow
    #[error("undecodable input at byte {offset}: {reason}")]
    Undecodable {
        /// Absolute file offset where decoding stopped
        offset: u64,
        /// What was wrong
        reason: String,
    },
}

impl RecordError {
    /// Whether parsing of the range stopped at this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecordError::Undecodable { .. })
    }
}

/// Single-pass iterator over the records of one range
pub struct RecordParser<'a> {
    format: SequenceFormat,
    data: &'a [u8],
    /// Absolute file offset of `data[0]`
    base: u64,
    /// Whether `data` runs to the end of the file
    at_eof: bool,
    pos: usize,
    done: bool,
}

impl<'a> RecordParser<'a> {
    /// Parse `data`, which starts at absolute file offset `base` and runs
    /// to the end of the file
    pub fn new(format: SequenceFormat, data: &'a [u8], base: u64) -> Self {
        Self {
            format,
            data,
            base,
            at_eof: true,
            pos: 0,
            done: false,
        }
    }

    /// Set whether `data` ends where the file ends
    ///
    /// A record truncated by the end of the file is fatal; a record
    /// truncated anywhere else is reported as malformed.
    pub fn at_eof(mut self, at_eof: bool) -> Self {
        self.at_eof = at_eof;
        self
    }

    fn abs(&self, pos: usize) -> u64 {
        self.base + pos as u64
    }

    fn skip_blank_lines(&mut self) {
        while let Some((line, next)) = next_line(self.data, self.pos) {
            if !line.iter().all(|b| b.is_ascii_whitespace()) {
                break;
            }
            self.pos = next;
        }
    }

    fn fail(&mut self, pos: usize, reason: impl Into<String>) -> RecordError {
        self.done = true;
        RecordError::Undecodable {
            offset: self.abs(pos),
            reason: reason.into(),
        }
    }

    fn truncated(&mut self, start: usize, reason: &str) -> RecordError {
        if self.at_eof {
            self.fail(start, format!("truncated record: {reason}"))
        } else {
            self.skip_malformed(start, reason)
        }
    }

    fn skip_malformed(&mut self, start: usize, reason: impl Into<String>) -> RecordError {
        self.pos = find_record_start(self.format, self.data, start + 1, self.data.len())
            .unwrap_or(self.data.len());
        RecordError::Malformed {
            offset: self.abs(start),
            reason: reason.into(),
        }
    }

    fn parse_fastq(&mut self, start: usize) -> Result<Record<'a>, RecordError> {
        let data = self.data;
        let Some((header, seq_pos)) = next_line(data, start) else {
            return Err(self.fail(start, "missing header"));
        };
        let Some((seq, plus_pos)) = next_line(data, seq_pos) else {
            return Err(self.truncated(start, "missing sequence line"));
        };
        let Some((plus, qual_pos)) = next_line(data, plus_pos) else {
            return Err(self.truncated(start, "missing '+' line"));
        };
        if !plus.starts_with(b"+") {
            return Err(self.skip_malformed(start, "expected '+' separator line"));
        }
        let Some((qual, next)) = next_line(data, qual_pos) else {
            return Err(self.truncated(start, "missing quality line"));
        };

        if seq.is_empty() {
            return Err(self.skip_malformed(start, "empty sequence"));
        }
        if qual.len() != seq.len() {
            return Err(self.skip_malformed(
                start,
                format!(
                    "quality length {} does not match sequence length {}",
                    qual.len(),
                    seq.len()
                ),
            ));
        }

        self.pos = next;
        Ok(Record {
            id: &header[1..],
            seq: Cow::Borrowed(seq),
            qual: Some(qual),
            offset: self.abs(seq_pos),
        })
    }

    fn parse_fasta(&mut self, start: usize) -> Result<Record<'a>, RecordError> {
        let data = self.data;
        let Some((header, seq_pos)) = next_line(data, start) else {
            return Err(self.fail(start, "missing header"));
        };

        let mut pos = seq_pos;
        let mut first: Option<&'a [u8]> = None;
        let mut joined: Option<Vec<u8>> = None;
        while let Some((line, next)) = next_line(data, pos) {
            if line.first() == Some(&b'>') {
                break;
            }
            pos = next;
            if line.is_empty() {
                continue;
            }
            if let Some(buf) = joined.as_mut() {
                buf.extend_from_slice(line);
            } else if let Some(prev) = first {
                let mut buf = Vec::with_capacity(prev.len() * 4);
                buf.extend_from_slice(prev);
                buf.extend_from_slice(line);
                joined = Some(buf);
            } else {
                first = Some(line);
            }
        }

        self.pos = pos;
        let seq = match joined {
            Some(buf) => Cow::Owned(buf),
            None => Cow::Borrowed(first.unwrap_or(&[])),
        };
        Ok(Record {
            id: &header[1..],
            seq,
            qual: None,
            offset: self.abs(seq_pos),
        })
    }
}

impl<'a> Iterator for RecordParser<'a> {
    type Item = Result<Record<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.skip_blank_lines();
        if self.pos >= self.data.len() {
            self.done = true;
            return None;
        }

        let start = self.pos;
        if self.data[start] != self.format.marker() {
            return Some(Err(self.fail(
                start,
                format!("expected '{}' at record start", self.format.marker() as char),
            )));
        }

        Some(match self.format {
            SequenceFormat::Fastq => self.parse_fastq(start),
            SequenceFormat::Fasta => self.parse_fasta(start),
        })
    }
}
