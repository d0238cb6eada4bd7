use std::fmt::Display;

use lazy_static::lazy_static;

use crate::substitution_models::FreqVector;

pub static NUCLEOTIDES: &[u8] = b"ACGT";
pub static BINARY: &[u8] = b"01";
pub static GAP: u8 = b'-';
pub static POSSIBLE_GAPS: &[u8] = b"-?.~*";

static AMB_NUCLEOTIDES: &[(u8, &[u8])] = &[
    (b'R', b"AG"),
    (b'Y', b"CT"),
    (b'S', b"CG"),
    (b'W', b"AT"),
    (b'K', b"GT"),
    (b'M', b"AC"),
    (b'B', b"CGT"),
    (b'D', b"AGT"),
    (b'H', b"ACT"),
    (b'V', b"ACG"),
    (b'U', b"T"),
];
static UNKNOWN_NUCLEOTIDES: &[u8] = b"NX";
static UNKNOWN_BINARY: &[u8] = b"";

const NOT_IN_ALPHABET: usize = usize::MAX;

/// Maps sequence characters to state codes.
///
/// Codes `0..state_count` are the unambiguous states, `state_count` is the completely unknown
/// state (gaps, `N`) and codes above it are partially ambiguous characters.
#[derive(Debug, PartialEq)]
pub struct Alphabet {
    name: &'static str,
    symbols: &'static [u8],
    ambiguous: &'static [(u8, &'static [u8])],
    unknown: &'static [u8],
    index: &'static [usize; 256],
}

impl Display for Alphabet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Alphabet {
    pub fn state_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &[u8] {
        self.symbols
    }

    pub fn unknown_state(&self) -> usize {
        self.symbols.len()
    }

    pub fn code_count(&self) -> usize {
        self.symbols.len() + 1 + self.ambiguous.len()
    }

    pub fn is_word(&self, word: &[u8]) -> bool {
        word.iter().all(|&c| self.code(c).is_some())
    }

    pub fn code(&self, char: u8) -> Option<usize> {
        match self.index[char.to_ascii_uppercase() as usize] {
            NOT_IN_ALPHABET => None,
            code => Some(code),
        }
    }

    pub fn is_ambiguous(&self, code: usize) -> bool {
        code >= self.state_count()
    }

    pub fn is_unknown(&self, code: usize) -> bool {
        code == self.unknown_state()
    }

    /// Which states are compatible with the given code.
    pub fn state_set(&self, code: usize) -> Vec<bool> {
        let n = self.state_count();
        if code < n {
            let mut set = vec![false; n];
            set[code] = true;
            set
        } else if code == n {
            vec![true; n]
        } else {
            let (_, members) = self.ambiguous[code - n - 1];
            self.symbols.iter().map(|s| members.contains(s)).collect()
        }
    }

    pub fn char_encoding(&self, code: usize) -> FreqVector {
        let set = self.state_set(code);
        FreqVector::from_iterator(set.len(), set.iter().map(|&b| if b { 1.0 } else { 0.0 }))
    }

    pub fn symbol(&self, code: usize) -> u8 {
        let n = self.state_count();
        if code < n {
            self.symbols[code]
        } else if code == n {
            GAP
        } else {
            self.ambiguous[code - n - 1].0
        }
    }
}

pub fn dna_alphabet() -> &'static Alphabet {
    &DNA_ALPHABET
}

pub fn binary_alphabet() -> &'static Alphabet {
    &BINARY_ALPHABET
}

pub fn alphabet_from_name(name: &str) -> Option<&'static Alphabet> {
    match name.to_lowercase().as_str() {
        "dna" | "nucleotide" => Some(dna_alphabet()),
        "binary" | "twostate" => Some(binary_alphabet()),
        _ => None,
    }
}

fn make_index(
    symbols: &[u8],
    ambiguous: &[(u8, &[u8])],
    unknown: &[u8],
) -> [usize; 256] {
    let mut index = [NOT_IN_ALPHABET; 256];
    for (i, &char) in symbols.iter().enumerate() {
        index[char as usize] = i;
    }
    let n = symbols.len();
    for &char in unknown.iter().chain(POSSIBLE_GAPS.iter()) {
        index[char as usize] = n;
    }
    for (i, (char, _)) in ambiguous.iter().enumerate() {
        index[*char as usize] = n + 1 + i;
    }
    index
}

lazy_static! {
    static ref NUCLEOTIDE_INDEX: [usize; 256] =
        make_index(NUCLEOTIDES, AMB_NUCLEOTIDES, UNKNOWN_NUCLEOTIDES);
    static ref BINARY_INDEX: [usize; 256] = make_index(BINARY, &[], UNKNOWN_BINARY);
    static ref DNA_ALPHABET: Alphabet = Alphabet {
        name: "DNA",
        symbols: NUCLEOTIDES,
        ambiguous: AMB_NUCLEOTIDES,
        unknown: UNKNOWN_NUCLEOTIDES,
        index: &NUCLEOTIDE_INDEX,
    };
    static ref BINARY_ALPHABET: Alphabet = Alphabet {
        name: "binary",
        symbols: BINARY,
        ambiguous: &[],
        unknown: UNKNOWN_BINARY,
        index: &BINARY_INDEX,
    };
}

#[cfg(test)]
mod tests;
