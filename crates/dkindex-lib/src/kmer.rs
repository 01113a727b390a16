//! K-mer extraction and packing
//!
//! A k-mer is packed into a `u64` with the first symbol in the most
//! significant position, so numeric order equals lexicographic order of the
//! k-mer strings. The encoder slides a window over a base string keeping
//! forward and reverse-complement registers up to date in O(1) per base.
//!
//! # Canonical order
//!
//! With canonicalization enabled, the emitted key is the numerically smaller
//! of the forward and reverse-complement packings. The comparison only
//! depends on the packed values, so every process and thread folds a k-mer
//! and its reverse complement onto the same key.

use crate::alphabet::Alphabet;
use crate::error::{IndexError, Result};

/// Slides a width-`k` window over base strings and emits packed keys
#[derive(Debug, Clone, Copy)]
pub struct KmerEncoder {
    k: usize,
    alphabet: Alphabet,
    canonical: bool,
    bits: usize,
    mask: u64,
    /// Left shift placing a symbol at the most significant slot
    top_shift: usize,
}

impl KmerEncoder {
    /// Create an encoder for width `k` over `alphabet`
    ///
    /// # Errors
    /// Returns [`IndexError::InvalidConfig`] if `k` is zero or
    /// `k * bits_per_symbol` exceeds the 64-bit key width.
    pub fn new(k: usize, alphabet: Alphabet, canonical: bool) -> Result<Self> {
        if k == 0 {
            return Err(IndexError::InvalidConfig("k must be at least 1".into()));
        }
        if k > alphabet.max_k() {
            return Err(IndexError::InvalidConfig(format!(
                "k={} exceeds the 64-bit key width for the {} alphabet (max k={})",
                k,
                alphabet,
                alphabet.max_k()
            )));
        }
        let bits = alphabet.bits_per_symbol();
        let total = k * bits;
        let mask = if total == 64 { u64::MAX } else { (1u64 << total) - 1 };
        Ok(Self {
            k,
            alphabet,
            canonical,
            bits,
            mask,
            top_shift: total - bits,
        })
    }

    /// K-mer width
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Alphabet the encoder packs
    #[inline]
    pub fn alphabet(&self) -> Alphabet {
        self.alphabet
    }

    /// Whether keys are folded with their reverse complement
    #[inline]
    pub fn is_canonical(&self) -> bool {
        self.canonical
    }

    /// Iterate over the valid windows of `seq`
    pub fn windows<'a>(&'a self, seq: &'a [u8]) -> Windows<'a> {
        Windows {
            encoder: self,
            seq,
            pos: 0,
            fwd: 0,
            rc: 0,
            run: 0,
            skipped: 0,
        }
    }

    /// Pack a k-length string without canonicalization
    ///
    /// Returns `None` if the length is not `k` or a symbol is outside the
    /// alphabet.
    pub fn encode(&self, kmer: &[u8]) -> Option<u64> {
        if kmer.len() != self.k {
            return None;
        }
        let mut key = 0u64;
        for &b in kmer {
            let code = self.alphabet.encode(b)? as u64;
            key = ((key << self.bits) | code) & self.mask;
        }
        Some(key)
    }

    /// Unpack a key to its upper-case string
    pub fn decode(&self, key: u64) -> String {
        let sym_mask = (1u64 << self.bits) - 1;
        (0..self.k)
            .map(|i| {
                let shift = self.top_shift - i * self.bits;
                self.alphabet.decode(((key >> shift) & sym_mask) as u8) as char
            })
            .collect()
    }

    /// Reverse complement of a packed key
    pub fn reverse_complement(&self, key: u64) -> u64 {
        let sym_mask = (1u64 << self.bits) - 1;
        let mut rest = key;
        let mut rc = 0u64;
        for _ in 0..self.k {
            let code = (rest & sym_mask) as u8;
            rc = (rc << self.bits) | self.alphabet.complement(code) as u64;
            rest >>= self.bits;
        }
        rc & self.mask
    }

    /// Canonical form of a packed key (identity when canonicalization is off)
    #[inline]
    pub fn canonical(&self, key: u64) -> u64 {
        if self.canonical {
            key.min(self.reverse_complement(key))
        } else {
            key
        }
    }
}

/// Lazy iterator of `(key, window_offset)` pairs over one base string
///
/// Windows containing a symbol outside the alphabet are skipped and counted
/// in [`Windows::skipped`].
pub struct Windows<'a> {
    encoder: &'a KmerEncoder,
    seq: &'a [u8],
    pos: usize,
    fwd: u64,
    rc: u64,
    /// Consecutive in-alphabet symbols ending at `pos - 1`
    run: usize,
    skipped: u64,
}

impl Windows<'_> {
    /// Windows skipped so far because they held an out-of-alphabet symbol
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Iterator for Windows<'_> {
    type Item = (u64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let enc = self.encoder;
        while self.pos < self.seq.len() {
            let byte = self.seq[self.pos];
            self.pos += 1;

            match enc.alphabet.encode(byte) {
                Some(code) => {
                    self.fwd = ((self.fwd << enc.bits) | code as u64) & enc.mask;
                    self.rc = (self.rc >> enc.bits)
                        | ((enc.alphabet.complement(code) as u64) << enc.top_shift);
                    self.run += 1;
                }
                None => {
                    self.fwd = 0;
                    self.rc = 0;
                    self.run = 0;
                }
            }

            if self.pos < enc.k {
                continue;
            }
            if self.run < enc.k {
                self.skipped += 1;
                continue;
            }
            let key = if enc.canonical { self.fwd.min(self.rc) } else { self.fwd };
            return Some((key, self.pos - enc.k));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining_bases = self.seq.len() - self.pos;
        let upper = if self.pos >= self.encoder.k {
            remaining_bases
        } else {
            (self.seq.len() + 1).saturating_sub(self.encoder.k)
        };
        (0, Some(upper))
    }
}
