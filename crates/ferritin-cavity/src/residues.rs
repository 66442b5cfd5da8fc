//! # Amino Acids
//!
//! The fixed 20-letter alphabet used for labels and mutation indices.
//! Ordering follows the alphabetical order of the one-letter codes
//! (`ACDEFGHIKLMNPQRSTVWY`) and is not configurable.
//!
use anyhow::{anyhow, Result};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Number of amino-acid classes predicted by the cavity model.
pub const NUM_AMINO_ACIDS: usize = 20;

#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum AminoAcid {
    A = 0,  C = 1,  D = 2,  E = 3,  F = 4,
    G = 5,  H = 6,  I = 7,  K = 8,  L = 9,
    M = 10, N = 11, P = 12, Q = 13, R = 14,
    S = 15, T = 16, V = 17, W = 18, Y = 19,
}

impl AminoAcid {
    pub fn to_index(&self) -> usize {
        *self as usize
    }
    pub fn from_index(idx: usize) -> Option<Self> {
        AminoAcid::iter().nth(idx)
    }
    pub fn from_letter(letter: char) -> Option<Self> {
        let mut buf = [0u8; 4];
        letter.encode_utf8(&mut buf).parse().ok()
    }
    pub fn letter(&self) -> char {
        // Display of a single-letter variant is always one char.
        self.to_string().chars().next().unwrap_or('X')
    }
}

/// Map a one-letter code to its class index. Unknown letters are an error.
pub fn aa1_to_index(letter: char) -> Result<usize> {
    AminoAcid::from_letter(letter)
        .map(|aa| aa.to_index())
        .ok_or_else(|| anyhow!("'{}' is not one of the 20 standard amino acids", letter))
}

pub fn index_to_aa1(idx: usize) -> Result<char> {
    AminoAcid::from_index(idx)
        .map(|aa| aa.letter())
        .ok_or_else(|| anyhow!("amino acid index {} out of range", idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_order() {
        let letters: String = AminoAcid::iter().map(|aa| aa.letter()).collect();
        assert_eq!(letters, "ACDEFGHIKLMNPQRSTVWY");
        assert_eq!(AminoAcid::iter().count(), NUM_AMINO_ACIDS);
    }

    #[test]
    fn test_letter_index_mapping() {
        assert_eq!(aa1_to_index('A').unwrap(), 0);
        assert_eq!(aa1_to_index('G').unwrap(), 5);
        assert_eq!(aa1_to_index('Y').unwrap(), 19);
        for idx in 0..NUM_AMINO_ACIDS {
            let letter = index_to_aa1(idx).unwrap();
            assert_eq!(aa1_to_index(letter).unwrap(), idx);
        }
    }

    #[test]
    fn test_unknown_letters() {
        assert!(aa1_to_index('X').is_err());
        assert!(aa1_to_index('a').is_err());
        assert!(index_to_aa1(20).is_err());
    }
}
