//! Values stored per k-mer and the rules for merging them
//!
//! An index is created with one [`MergeStrategy`]; every payload it ever
//! holds is the matching [`Payload`] variant. All merge rules are
//! commutative and associative, so pairs for the same key may arrive in any
//! order from any thread or process.
//!
//! # Quality policy
//!
//! For [`MergeStrategy::BestQuality`] the occurrence with the highest k-mer
//! quality is kept; equal qualities keep the smaller global offset. The
//! quality of a window is the probability that all of its bases were called
//! correctly, `prod(1 - 10^(-q/10))`, from Phred+33 scores (scores below 1
//! are read as 1).

use std::fmt;
use std::str::FromStr;

use crate::constants::PHRED_OFFSET;

/// Bits of a global offset holding the byte position within one input file
pub const OFFSET_BITS: u32 = 48;

const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;

/// Compose a global offset from a file ordinal and a byte position
///
/// The ordinal counts `build` invocations on an index, starting at 0, so a
/// single-file index records plain byte offsets.
#[inline]
pub fn global_offset(file_ordinal: u16, byte: u64) -> u64 {
    ((file_ordinal as u64) << OFFSET_BITS) | (byte & OFFSET_MASK)
}

/// Merge rule an index is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Keep every occurrence offset
    AppendPosition,
    /// Count occurrences
    IncrementCount,
    /// Keep the offset of the best-quality occurrence
    BestQuality,
}

impl MergeStrategy {
    /// Wire tag identifying the strategy
    #[inline]
    pub const fn tag(self) -> u8 {
        match self {
            MergeStrategy::AppendPosition => 1,
            MergeStrategy::IncrementCount => 2,
            MergeStrategy::BestQuality => 3,
        }
    }

    /// Inverse of [`MergeStrategy::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MergeStrategy::AppendPosition),
            2 => Some(MergeStrategy::IncrementCount),
            3 => Some(MergeStrategy::BestQuality),
            _ => None,
        }
    }

    /// Whether the strategy reads per-base quality strings
    #[inline]
    pub const fn needs_quality(self) -> bool {
        matches!(self, MergeStrategy::BestQuality)
    }

    /// Payload describing one occurrence
    #[inline]
    pub fn occurrence(self, position: u64, quality: f32) -> Payload {
        match self {
            MergeStrategy::AppendPosition => Payload::Positions(vec![position]),
            MergeStrategy::IncrementCount => Payload::Count(1),
            MergeStrategy::BestQuality => Payload::PositionQuality { position, quality },
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::AppendPosition => "positions",
            MergeStrategy::IncrementCount => "count",
            MergeStrategy::BestQuality => "quality",
        };
        f.write_str(name)
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positions" | "position" => Ok(MergeStrategy::AppendPosition),
            "count" | "counts" => Ok(MergeStrategy::IncrementCount),
            "quality" | "position-quality" => Ok(MergeStrategy::BestQuality),
            other => Err(format!(
                "unknown payload '{other}' (expected positions, count or quality)"
            )),
        }
    }
}

/// Value associated with a key
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Global offsets of every occurrence
    Positions(Vec<u64>),
    /// Number of occurrences
    Count(u64),
    /// Best occurrence and its quality
    PositionQuality {
        /// Global offset of the occurrence
        position: u64,
        /// Probability that every base of the window is correct
        quality: f32,
    },
}

impl Payload {
    /// Fold `other` into `self`
    ///
    /// Variants never mix within one index: the wire decoder rejects frames
    /// built with another strategy, so a mismatch here is a logic error.
    pub fn merge(&mut self, other: Payload) {
        match (self, other) {
            (Payload::Positions(mine), Payload::Positions(mut theirs)) => {
                if mine.is_empty() {
                    *mine = theirs;
                } else {
                    mine.append(&mut theirs);
                }
            }
            (Payload::Count(mine), Payload::Count(theirs)) => {
                *mine = mine.saturating_add(theirs);
            }
            (
                Payload::PositionQuality { position, quality },
                Payload::PositionQuality {
                    position: other_pos,
                    quality: other_q,
                },
            ) => {
                let better = match other_q.total_cmp(quality) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Equal => other_pos < *position,
                    std::cmp::Ordering::Less => false,
                };
                if better {
                    *position = other_pos;
                    *quality = other_q;
                }
            }
            (mine, theirs) => {
                debug_assert!(false, "payload variants mixed: {mine:?} <- {theirs:?}");
            }
        }
    }

    /// Sort position lists; no-op for other variants
    ///
    /// Global offsets are unique per occurrence, so a repeated offset means
    /// a pair was delivered twice.
    pub fn normalize(&mut self) {
        if let Payload::Positions(list) = self {
            list.sort_unstable();
            debug_assert!(
                list.windows(2).all(|w| w[0] != w[1]),
                "occurrence delivered twice: {list:?}"
            );
        }
    }

    /// Occurrence count represented by this payload
    pub fn occurrences(&self) -> u64 {
        match self {
            Payload::Positions(list) => list.len() as u64,
            Payload::Count(c) => *c,
            Payload::PositionQuality { .. } => 1,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Positions(list) => {
                f.write_str("[")?;
                for (i, p) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_str("]")
            }
            Payload::Count(c) => write!(f, "{c}"),
            Payload::PositionQuality { position, quality } => {
                write!(f, "{position}@{quality:.4}")
            }
        }
    }
}

/// Prefix sums of per-base log10 correctness probabilities for one read
///
/// Window qualities are differences of two prefix entries, so each window
/// costs O(1) regardless of `k`.
#[derive(Debug, Clone, Default)]
pub struct QualityProfile {
    prefix: Vec<f64>,
}

impl QualityProfile {
    /// Build the profile for a Phred+33 quality string
    pub fn new(qual: &[u8]) -> Self {
        let mut prefix = Vec::with_capacity(qual.len() + 1);
        let mut acc = 0.0f64;
        prefix.push(acc);
        for &q in qual {
            acc += log10_correct(q);
            prefix.push(acc);
        }
        Self { prefix }
    }

    /// Quality of the `k` bases starting at `offset`
    ///
    /// Returns 0 when the window runs past the quality string.
    pub fn window(&self, offset: usize, k: usize) -> f32 {
        match (self.prefix.get(offset), self.prefix.get(offset + k)) {
            (Some(start), Some(end)) => 10f64.powf(end - start) as f32,
            _ => 0.0,
        }
    }
}

#[inline]
fn log10_correct(raw: u8) -> f64 {
    let q = raw.saturating_sub(PHRED_OFFSET).max(1) as f64;
    (1.0 - 10f64.powf(-q / 10.0)).log10()
}
