//! Sequence alphabets and their symbol encodings
//!
//! Symbols are numbered in lexicographic order so that comparing packed
//! keys numerically compares the k-mer strings:
//!
//! - DNA:  A -> 0, C -> 1, G -> 2, T -> 3 (2 bits)
//! - RNA:  A -> 0, C -> 1, G -> 2, U -> 3 (2 bits)
//! - DNA5: A -> 0, C -> 1, G -> 2, T -> 3, N -> 4 (3 bits)
//!
//! Lower-case input is accepted. Any other byte is outside the alphabet.

use std::fmt;
use std::str::FromStr;

/// Marker for bytes outside the alphabet in the lookup tables
const X: u8 = 0xFF;

const fn build_table(symbols: &[u8]) -> [u8; 256] {
    let mut t = [X; 256];
    let mut i = 0;
    while i < symbols.len() {
        let upper = symbols[i];
        t[upper as usize] = i as u8;
        t[upper.to_ascii_lowercase() as usize] = i as u8;
        i += 1;
    }
    t
}

static DNA_TABLE: [u8; 256] = build_table(b"ACGT");
static RNA_TABLE: [u8; 256] = build_table(b"ACGU");
static DNA5_TABLE: [u8; 256] = build_table(b"ACGTN");

/// Symbol set a k-mer is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Alphabet {
    /// A, C, G, T
    #[default]
    Dna,
    /// A, C, G, U
    Rna,
    /// A, C, G, T and the ambiguity symbol N
    Dna5,
}

impl Alphabet {
    /// Bits used to pack one symbol
    #[inline]
    pub const fn bits_per_symbol(self) -> usize {
        match self {
            Alphabet::Dna | Alphabet::Rna => 2,
            Alphabet::Dna5 => 3,
        }
    }

    /// Number of symbols in the alphabet
    #[inline]
    pub const fn size(self) -> usize {
        self.symbols().len()
    }

    /// Upper-case symbols in code order
    #[inline]
    pub const fn symbols(self) -> &'static [u8] {
        match self {
            Alphabet::Dna => b"ACGT",
            Alphabet::Rna => b"ACGU",
            Alphabet::Dna5 => b"ACGTN",
        }
    }

    /// Longest k that fits in a 64-bit key
    #[inline]
    pub const fn max_k(self) -> usize {
        crate::constants::KEY_BITS / self.bits_per_symbol()
    }

    /// Encode one byte, `None` when it is outside the alphabet
    #[inline]
    pub fn encode(self, byte: u8) -> Option<u8> {
        let table = match self {
            Alphabet::Dna => &DNA_TABLE,
            Alphabet::Rna => &RNA_TABLE,
            Alphabet::Dna5 => &DNA5_TABLE,
        };
        let code = table[byte as usize];
        if code == X {
            None
        } else {
            Some(code)
        }
    }

    /// Decode a symbol code to its upper-case byte
    #[inline]
    pub fn decode(self, code: u8) -> u8 {
        let symbols = self.symbols();
        symbols[code as usize % symbols.len()]
    }

    /// Complement of a symbol code (N is its own complement)
    #[inline]
    pub const fn complement(self, code: u8) -> u8 {
        if code < 4 {
            3 - code
        } else {
            code
        }
    }
}

impl fmt::Display for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Alphabet::Dna => "dna",
            Alphabet::Rna => "rna",
            Alphabet::Dna5 => "dna5",
        };
        f.write_str(name)
    }
}

impl FromStr for Alphabet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dna" => Ok(Alphabet::Dna),
            "rna" => Ok(Alphabet::Rna),
            "dna5" => Ok(Alphabet::Dna5),
            other => Err(format!("unknown alphabet '{other}' (expected dna, rna or dna5)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_dna() {
        assert_eq!(Alphabet::Dna.encode(b'A'), Some(0));
        assert_eq!(Alphabet::Dna.encode(b'c'), Some(1));
        assert_eq!(Alphabet::Dna.encode(b'G'), Some(2));
        assert_eq!(Alphabet::Dna.encode(b't'), Some(3));
        assert_eq!(Alphabet::Dna.encode(b'N'), None);
        assert_eq!(Alphabet::Dna.encode(b'U'), None);
        assert_eq!(Alphabet::Dna.encode(b'\n'), None);
    }

    #[test]
    fn test_encode_rna_and_dna5() {
        assert_eq!(Alphabet::Rna.encode(b'U'), Some(3));
        assert_eq!(Alphabet::Rna.encode(b'T'), None);
        assert_eq!(Alphabet::Dna5.encode(b'n'), Some(4));
        assert_eq!(Alphabet::Dna5.encode(b'X'), None);
    }

    #[test]
    fn test_complement() {
        let a = Alphabet::Dna;
        assert_eq!(a.decode(a.complement(0)), b'T');
        assert_eq!(a.decode(a.complement(1)), b'G');
        assert_eq!(a.decode(a.complement(2)), b'C');
        assert_eq!(a.decode(a.complement(3)), b'A');
        assert_eq!(Alphabet::Dna5.complement(4), 4);
    }

    #[test]
    fn test_max_k() {
        assert_eq!(Alphabet::Dna.max_k(), 32);
        assert_eq!(Alphabet::Dna5.max_k(), 21);
    }

    #[test]
    fn test_parse() {
        assert_eq!("DNA".parse::<Alphabet>().unwrap(), Alphabet::Dna);
        assert_eq!("dna5".parse::<Alphabet>().unwrap(), Alphabet::Dna5);
        assert!("protein".parse::<Alphabet>().is_err());
    }
}
