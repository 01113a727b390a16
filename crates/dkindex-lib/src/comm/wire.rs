//! Frame encoding for pairs crossing process boundaries
//!
//! All integers are little-endian.
//!
//! ```text
//! Pairs frame:
//!   u8  FRAME_PAIRS
//!   u8  merge strategy tag
//!   u32 number of entries
//!   entries:
//!     u64 key
//!     payload:
//!       positions: u32 n, then n x u64
//!       count:     u64
//!       quality:   u64 position, u32 f32 bits
//! Done frame:  u8 FRAME_DONE
//! Abort frame: u8 FRAME_ABORT
//! ```

use crate::accumulator::Batch;
use crate::payload::{MergeStrategy, Payload};

const FRAME_PAIRS: u8 = 1;
const FRAME_DONE: u8 = 2;
const FRAME_ABORT: u8 = 3;

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Pairs owned by the receiver
    Pairs(Batch),
    /// The sender has nothing more to send
    Done,
    /// The sender aborted its build
    Abort,
}

/// Encode pairs into a frame for `strategy`
pub fn encode_pairs(strategy: MergeStrategy, pairs: &[(u64, Payload)]) -> Vec<u8> {
    let entry_size = match strategy {
        MergeStrategy::AppendPosition => 8 + 4 + 8,
        MergeStrategy::IncrementCount => 8 + 8,
        MergeStrategy::BestQuality => 8 + 8 + 4,
    };
    let mut buf = Vec::with_capacity(6 + pairs.len() * entry_size);
    buf.push(FRAME_PAIRS);
    buf.push(strategy.tag());
    buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (key, payload) in pairs {
        buf.extend_from_slice(&key.to_le_bytes());
        match payload {
            Payload::Positions(list) => {
                buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
                for p in list {
                    buf.extend_from_slice(&p.to_le_bytes());
                }
            }
            Payload::Count(c) => buf.extend_from_slice(&c.to_le_bytes()),
            Payload::PositionQuality { position, quality } => {
                buf.extend_from_slice(&position.to_le_bytes());
                buf.extend_from_slice(&quality.to_bits().to_le_bytes());
            }
        }
    }
    buf
}

/// Encode an end-of-stream frame
pub fn encode_done() -> Vec<u8> {
    vec![FRAME_DONE]
}

/// Encode an abort frame
pub fn encode_abort() -> Vec<u8> {
    vec![FRAME_ABORT]
}

/// Decode a frame produced by an index using `strategy`
///
/// # Errors
/// Returns a description of the problem for unknown tags, frames built
/// with another strategy, truncated frames and trailing bytes.
pub fn decode(strategy: MergeStrategy, frame: &[u8]) -> Result<Frame, String> {
    let mut cur = Cursor { buf: frame };
    match cur.u8()? {
        FRAME_DONE => cur.finish(Frame::Done),
        FRAME_ABORT => cur.finish(Frame::Abort),
        FRAME_PAIRS => {
            let tag = cur.u8()?;
            if tag != strategy.tag() {
                return Err(format!(
                    "frame built for strategy tag {tag}, this index uses {strategy} (tag {})",
                    strategy.tag()
                ));
            }
            let n = cur.u32()? as usize;
            // each entry takes at least 12 bytes; reject absurd counts early
            if n > cur.buf.len() / 12 {
                return Err(format!("entry count {n} exceeds frame size"));
            }
            let mut pairs = Vec::with_capacity(n);
            for _ in 0..n {
                let key = cur.u64()?;
                let payload = match strategy {
                    MergeStrategy::AppendPosition => {
                        let len = cur.u32()? as usize;
                        if len > cur.buf.len() / 8 {
                            return Err(format!("position list of {len} exceeds frame size"));
                        }
                        let mut list = Vec::with_capacity(len);
                        for _ in 0..len {
                            list.push(cur.u64()?);
                        }
                        Payload::Positions(list)
                    }
                    MergeStrategy::IncrementCount => Payload::Count(cur.u64()?),
                    MergeStrategy::BestQuality => Payload::PositionQuality {
                        position: cur.u64()?,
                        quality: f32::from_bits(cur.u32()?),
                    },
                };
                pairs.push((key, payload));
            }
            cur.finish(Frame::Pairs(pairs))
        }
        other => Err(format!("unknown frame tag {other}")),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], String> {
        if self.buf.len() < N {
            return Err(format!("truncated frame: need {N} bytes, have {}", self.buf.len()));
        }
        let (head, rest) = self.buf.split_at(N);
        self.buf = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }

    fn finish(self, frame: Frame) -> Result<Frame, String> {
        if self.buf.is_empty() {
            Ok(frame)
        } else {
            Err(format!("{} trailing bytes after frame", self.buf.len()))
        }
    }
}
