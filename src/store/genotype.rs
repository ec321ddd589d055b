use super::{check_index, check_length, hamming, Haplotype, PackedBits};
use crate::config::MAX_MARKERS;
use crate::errors::{Error, Result};
use ndarray::ArrayView1;

/// Diploid calls over a marker panel, packed as two allele-count planes plus a
/// presence plane, and the multiplicity of the individual in the current bootstrap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Genotype {
    allele1: PackedBits,
    allele2: PackedBits,
    present: PackedBits,
    pub bootstrap_count: u32,
}

impl Genotype {
    pub fn new() -> Self {
        Genotype::default()
    }

    /// Pack the calls of `markers` (indices into `calls`) into a panel of that order.
    pub fn from_calls(calls: ArrayView1<Option<u8>>, markers: &[usize]) -> Result<Self> {
        check_length(markers.len(), "Genotype::from_calls")?;
        let mut genotype = Genotype::new();
        for (idx, &marker) in markers.iter().enumerate() {
            let call = *calls
                .get(marker)
                .ok_or_else(|| Error::invalid_index(marker, calls.len(), "Genotype::from_calls"))?;
            genotype.set_snp(idx, call)?;
        }
        Ok(genotype)
    }

    pub fn from_call_string(calls: &str) -> Result<Self> {
        check_length(calls.len(), "Genotype::from_call_string")?;
        let mut genotype = Genotype::new();
        for (idx, ch) in calls.chars().enumerate() {
            let call = match ch {
                '0' => Some(0),
                '1' => Some(1),
                '2' => Some(2),
                '?' => None,
                _ => {
                    return Err(Error::invalid_value(
                        ch,
                        "genotype strings only contain '0', '1', '2' or '?'",
                    ))
                }
            };
            genotype.assign(idx, call);
        }
        Ok(genotype)
    }

    pub fn set_snp(&mut self, idx: usize, call: Option<u8>) -> Result<()> {
        check_index(idx, "Genotype::set_snp")?;
        if let Some(value) = call {
            if value > 2 {
                return Err(Error::invalid_value(value, "genotype calls are 0, 1, 2 or missing"));
            }
        }
        self.assign(idx, call);
        Ok(())
    }

    /// Allele count at `idx`, None when missing.
    pub fn get_snp(&self, idx: usize) -> Result<Option<u8>> {
        check_index(idx, "Genotype::get_snp")?;
        Ok(self.call(idx))
    }

    pub fn to_call_string(&self, len: usize) -> Result<String> {
        check_length(len, "Genotype::to_call_string")?;
        Ok((0..len)
            .map(|idx| match self.call(idx) {
                Some(value) => (b'0' + value) as char,
                None => '?',
            })
            .collect())
    }

    /// Number of allele disagreements between the unordered pair {h1, h2} and this
    /// genotype over the first `len` markers, missing calls excluded.
    pub fn hamming_distance(&self, len: usize, h1: &Haplotype, h2: &Haplotype) -> Result<u32> {
        check_length(len, "Genotype::hamming_distance")?;
        Ok(hamming::hamming_distance(len, h1, h2, self))
    }

    #[inline]
    pub(crate) fn call(&self, idx: usize) -> Option<u8> {
        if self.present.bit(idx) {
            Some(self.allele1.bit(idx) as u8 + self.allele2.bit(idx) as u8)
        } else {
            None
        }
    }

    #[inline]
    fn assign(&mut self, idx: usize, call: Option<u8>) {
        let (a1, a2, present) = match call {
            Some(0) => (false, false, true),
            Some(1) => (true, false, true),
            Some(2) => (true, true, true),
            _ => (false, false, false),
        };
        self.allele1.assign(idx, a1);
        self.allele2.assign(idx, a2);
        self.present.assign(idx, present);
    }

    #[inline]
    pub(crate) fn planes(&self) -> (&PackedBits, &PackedBits, &PackedBits) {
        (&self.allele1, &self.allele2, &self.present)
    }
}

/// Genotypes of a whole cohort restricted to a growing marker panel.
#[derive(Clone, Debug, Default)]
pub struct GenotypeList {
    genotypes: Vec<Genotype>,
    n_markers: usize,
}

impl GenotypeList {
    pub fn with_bootstrap(bootstrap_counts: &[u32]) -> Self {
        GenotypeList {
            genotypes: bootstrap_counts
                .iter()
                .map(|&count| Genotype {
                    bootstrap_count: count,
                    ..Genotype::default()
                })
                .collect(),
            n_markers: 0,
        }
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn len(&self) -> usize {
        self.genotypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genotypes.is_empty()
    }

    pub fn genotypes(&self) -> &[Genotype] {
        &self.genotypes
    }

    /// Append the cohort's calls at `marker` as the next panel position.
    pub fn add_marker(&mut self, marker: ArrayView1<Option<u8>>) -> Result<()> {
        if marker.len() != self.genotypes.len() {
            return Err(Error::invalid_index(
                marker.len(),
                self.genotypes.len(),
                "GenotypeList::add_marker, sample count differs",
            ));
        }
        if self.n_markers >= MAX_MARKERS {
            return Err(Error::invalid_index(
                self.n_markers,
                MAX_MARKERS,
                "GenotypeList::add_marker, the panel is full",
            ));
        }
        let idx = self.n_markers;
        for (genotype, &call) in self.genotypes.iter_mut().zip(marker.iter()) {
            genotype.assign(idx, call);
        }
        self.n_markers += 1;
        Ok(())
    }

    /// Forget the most recently added marker.
    pub fn remove_last_marker(&mut self) {
        debug_assert!(self.n_markers > 0);
        self.n_markers = self.n_markers.saturating_sub(1);
    }
}
