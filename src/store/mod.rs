//! Fixed-capacity bit-packed haplotype and genotype storage.
//!
//! Every haplotype and genotype carries `MAX_MARKERS` bits per plane regardless of the
//! panel it currently describes; the panel length lives in the owning set.

pub mod genotype;
pub mod hamming;
pub mod haplotype;

pub use genotype::{Genotype, GenotypeList};
pub use hamming::{hamming_distance, hamming_distance8, Native, PopCount, Portable};
pub use haplotype::{Haplotype, HaplotypeSet};

use crate::config::{MAX_MARKERS, N_WORDS, WORD_BITS};
use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PackedBits([u64; N_WORDS]);

impl PackedBits {
    pub fn get(&self, idx: usize) -> Result<bool> {
        check_index(idx, "PackedBits::get")?;
        Ok(self.bit(idx))
    }

    pub fn set(&mut self, idx: usize, value: bool) -> Result<()> {
        check_index(idx, "PackedBits::set")?;
        self.assign(idx, value);
        Ok(())
    }

    #[inline]
    pub(crate) fn bit(&self, idx: usize) -> bool {
        (self.0[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 == 1
    }

    #[inline]
    pub(crate) fn assign(&mut self, idx: usize, value: bool) {
        let word = &mut self.0[idx / WORD_BITS];
        let shift = idx % WORD_BITS;
        *word = (*word & !(1u64 << shift)) | ((value as u64) << shift);
    }

    #[inline]
    pub(crate) fn words(&self) -> &[u64; N_WORDS] {
        &self.0
    }
}

pub(crate) fn check_index(idx: usize, context: &'static str) -> Result<()> {
    if idx >= MAX_MARKERS {
        Err(Error::invalid_index(idx, MAX_MARKERS, context))
    } else {
        Ok(())
    }
}

pub(crate) fn check_length(len: usize, context: &'static str) -> Result<()> {
    if len > MAX_MARKERS {
        Err(Error::invalid_index(len, MAX_MARKERS, context))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip_across_words() {
        let mut bits = PackedBits::default();
        for idx in [0, 1, 63, 64, 65, MAX_MARKERS - 1].iter() {
            bits.set(*idx, true).unwrap();
            assert!(bits.get(*idx).unwrap());
        }
        assert!(!bits.get(2).unwrap());
        bits.set(64, false).unwrap();
        assert!(!bits.get(64).unwrap());
        assert!(bits.get(63).unwrap());
        assert!(bits.get(65).unwrap());
    }

    #[test]
    fn out_of_capacity_index_fails() {
        let mut bits = PackedBits::default();
        assert!(matches!(
            bits.set(MAX_MARKERS, true),
            Err(Error::InvalidIndex { .. })
        ));
        assert!(matches!(
            bits.get(MAX_MARKERS + 10),
            Err(Error::InvalidIndex { .. })
        ));
    }
}
