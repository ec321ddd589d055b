use super::{check_index, check_length, PackedBits};
use crate::config::MAX_MARKERS;
use crate::errors::{Error, Result};

/// An allele sequence over the current marker panel with its population frequency.
#[derive(Clone, Copy, Debug, Default)]
pub struct Haplotype {
    pub(crate) bits: PackedBits,
    pub frequency: f64,
    /// frequency of the previous EM iteration
    pub(crate) old_frequency: f64,
}

// the previous-iteration frequency is EM scratch
impl PartialEq for Haplotype {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits && self.frequency == other.frequency
    }
}

impl Haplotype {
    pub fn new(frequency: f64) -> Self {
        Haplotype {
            bits: PackedBits::default(),
            frequency,
            old_frequency: 0.0,
        }
    }

    pub fn from_bit_string(alleles: &str, frequency: f64) -> Result<Self> {
        check_length(alleles.len(), "Haplotype::from_bit_string")?;
        let mut haplotype = Haplotype::new(frequency);
        for (idx, ch) in alleles.chars().enumerate() {
            match ch {
                '0' => haplotype.bits.assign(idx, false),
                '1' => haplotype.bits.assign(idx, true),
                _ => {
                    return Err(Error::invalid_value(
                        ch,
                        "haplotype strings only contain '0' or '1'",
                    ))
                }
            }
        }
        Ok(haplotype)
    }

    pub fn get_allele(&self, idx: usize) -> Result<u8> {
        check_index(idx, "Haplotype::get_allele")?;
        Ok(self.bits.bit(idx) as u8)
    }

    pub fn set_allele(&mut self, idx: usize, allele: u8) -> Result<()> {
        check_index(idx, "Haplotype::set_allele")?;
        match allele {
            0 | 1 => {
                self.bits.assign(idx, allele == 1);
                Ok(())
            }
            _ => Err(Error::invalid_value(allele, "haplotype alleles are 0 or 1")),
        }
    }

    pub fn to_bit_string(&self, len: usize) -> Result<String> {
        check_length(len, "Haplotype::to_bit_string")?;
        Ok((0..len)
            .map(|idx| if self.bits.bit(idx) { '1' } else { '0' })
            .collect())
    }

    #[inline]
    pub(crate) fn allele(&self, idx: usize) -> u8 {
        self.bits.bit(idx) as u8
    }
}

/// One ordered haplotype list per HLA allele, all over the same marker panel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HaplotypeSet {
    n_markers: usize,
    lists: Vec<Vec<Haplotype>>,
}

impl HaplotypeSet {
    pub fn new(n_alleles: usize, n_markers: usize) -> Result<Self> {
        check_length(n_markers, "HaplotypeSet::new")?;
        Ok(HaplotypeSet {
            n_markers,
            lists: vec![Vec::new(); n_alleles],
        })
    }

    /// Panel-free starting set: one empty haplotype per allele seen in the weighted
    /// cohort, with frequency proportional to its weighted allele count.
    pub fn initial(allele_counts: &[u64]) -> Self {
        let total: u64 = allele_counts.iter().sum();
        let lists = allele_counts
            .iter()
            .map(|&count| {
                if count > 0 {
                    vec![Haplotype::new(count as f64 / total as f64)]
                } else {
                    Vec::new()
                }
            })
            .collect();
        HaplotypeSet {
            n_markers: 0,
            lists,
        }
    }

    pub fn push(&mut self, allele: usize, haplotype: Haplotype) -> Result<()> {
        let n_alleles = self.lists.len();
        self.lists
            .get_mut(allele)
            .ok_or_else(|| Error::invalid_index(allele, n_alleles, "HaplotypeSet::push"))?
            .push(haplotype);
        Ok(())
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn n_alleles(&self) -> usize {
        self.lists.len()
    }

    pub fn list(&self, allele: usize) -> &[Haplotype] {
        &self.lists[allele]
    }

    pub(crate) fn list_mut(&mut self, allele: usize) -> &mut Vec<Haplotype> {
        &mut self.lists[allele]
    }

    pub fn lists(&self) -> &[Vec<Haplotype>] {
        &self.lists
    }

    pub fn total_haplotypes(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn total_frequency(&self) -> f64 {
        self.haplotypes().map(|h| h.frequency).sum()
    }

    fn haplotypes(&self) -> impl Iterator<Item = &Haplotype> {
        self.lists.iter().flatten()
    }

    fn haplotypes_mut(&mut self) -> impl Iterator<Item = &mut Haplotype> {
        self.lists.iter_mut().flatten()
    }

    /// Extend the panel by one marker: every haplotype is replaced by a copy carrying
    /// allele 0 followed by a copy carrying allele 1 at the new position.
    pub fn doubled(&self) -> Result<HaplotypeSet> {
        if self.n_markers >= MAX_MARKERS {
            return Err(Error::invalid_index(
                self.n_markers,
                MAX_MARKERS,
                "HaplotypeSet::doubled, the panel is full",
            ));
        }
        let new_idx = self.n_markers;
        let lists = self
            .lists
            .iter()
            .map(|list| {
                list.iter()
                    .flat_map(|haplotype| {
                        let mut zero = *haplotype;
                        zero.bits.assign(new_idx, false);
                        let mut one = *haplotype;
                        one.bits.assign(new_idx, true);
                        vec![zero, one]
                    })
                    .collect()
            })
            .collect();
        Ok(HaplotypeSet {
            n_markers: self.n_markers + 1,
            lists,
        })
    }

    /// Seed the frequencies of `doubled` (built by `doubled()` from self) by splitting each
    /// parent frequency according to the new marker's allele frequency.
    pub fn seed_doubled(&self, doubled: &mut HaplotypeSet, allele_freq: f64, init_offset: f64) {
        debug_assert_eq!(doubled.n_markers, self.n_markers + 1);
        let (p0, p1) = (1.0 - allele_freq, allele_freq);
        for (src, dst) in self.lists.iter().zip(doubled.lists.iter_mut()) {
            debug_assert_eq!(dst.len(), 2 * src.len());
            for (parent, children) in src.iter().zip(dst.chunks_exact_mut(2)) {
                children[0].frequency = parent.frequency * p0 + init_offset;
                children[1].frequency = parent.frequency * p1 + init_offset;
            }
        }
    }

    /// Collapse sibling pairs of a doubled set where either sibling is rarer than
    /// `rare_freq` into the more frequent pattern; collapsed haplotypes still below
    /// `min_freq` are dropped. Frequencies are renormalized to sum to one.
    pub fn pruned_doubled(&self, rare_freq: f64, min_freq: f64) -> HaplotypeSet {
        let mut total = 0.0;
        let lists = self
            .lists
            .iter()
            .map(|list| {
                let mut kept = Vec::with_capacity(list.len());
                for siblings in list.chunks_exact(2) {
                    let (h0, h1) = (&siblings[0], &siblings[1]);
                    let sum = h0.frequency + h1.frequency;
                    if h0.frequency < rare_freq || h1.frequency < rare_freq {
                        if sum >= min_freq {
                            let mut merged = if h0.frequency >= h1.frequency { *h0 } else { *h1 };
                            merged.frequency = sum;
                            kept.push(merged);
                            total += sum;
                        }
                    } else {
                        kept.push(*h0);
                        kept.push(*h1);
                        total += sum;
                    }
                }
                kept
            })
            .collect();
        let mut pruned = HaplotypeSet {
            n_markers: self.n_markers,
            lists,
        };
        if total > 0.0 {
            pruned.scale_frequency(1.0 / total);
        }
        pruned
    }

    pub(crate) fn save_clear_frequency(&mut self) {
        for haplotype in self.haplotypes_mut() {
            haplotype.old_frequency = haplotype.frequency;
            haplotype.frequency = 0.0;
        }
    }

    pub(crate) fn scale_frequency(&mut self, scale: f64) {
        for haplotype in self.haplotypes_mut() {
            haplotype.frequency *= scale;
        }
    }
}
