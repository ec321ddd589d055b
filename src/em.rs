//! Haplotype pair enumeration and EM estimation of haplotype frequencies.

use bv::BitVec;
use derive_new::new;
use log::debug;
use ndarray::ArrayView1;

use crate::config::EmParams;
use crate::errors::{Error, Result};
use crate::hla::HlaPair;
use crate::store::{hamming_distance, hamming_distance8, GenotypeList, HaplotypeSet};

/// Position of a haplotype inside a `HaplotypeSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub(crate) struct HaplotypeRef {
    allele: usize,
    index: usize,
}

#[derive(Debug, Clone, Copy)]
struct HaplotypePair {
    h1: HaplotypeRef,
    h2: HaplotypeRef,
    prob: f64,
}

impl HaplotypePair {
    fn new(h1: HaplotypeRef, h2: HaplotypeRef) -> Self {
        HaplotypePair { h1, h2, prob: 0.0 }
    }
}

/// The haplotype pairs of one in-bag individual explaining its genotype best.
#[derive(Debug)]
struct SamplePairs {
    sample: usize,
    bootstrap_count: u32,
    pairs: Vec<HaplotypePair>,
    /// whether each pair agrees with the individual's call at the candidate marker
    consistent: BitVec,
}

#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct EmSummary {
    pub iterations: usize,
    pub log_likelihood: f64,
    pub converged: bool,
}

#[derive(Debug)]
pub struct EmEstimator {
    params: EmParams,
    samples: Vec<SamplePairs>,
    distances: Vec<u32>,
}

impl EmEstimator {
    pub fn new(params: EmParams) -> Self {
        EmEstimator {
            params,
            samples: Vec::new(),
            distances: Vec::new(),
        }
    }

    pub fn params(&self) -> &EmParams {
        &self.params
    }

    /// Double `current` and collect, for every in-bag individual, the pairs of doubled
    /// haplotypes from its two allele lists with minimal distance to its genotype over
    /// the current panel. Returns the doubled set.
    pub fn prepare_haplotypes(
        &mut self,
        current: &HaplotypeSet,
        genotypes: &GenotypeList,
        labels: &[HlaPair],
    ) -> Result<HaplotypeSet> {
        if genotypes.len() != labels.len() {
            return Err(Error::invalid_index(
                labels.len(),
                genotypes.len(),
                "EmEstimator::prepare_haplotypes, genotypes and labels differ in length",
            ));
        }
        let next = current.doubled()?;
        let len = current.n_markers();
        self.samples.clear();

        for (sample, (genotype, label)) in genotypes.genotypes().iter().zip(labels).enumerate() {
            if genotype.bootstrap_count == 0 {
                continue;
            }
            let (a1, a2) = (label.allele1, label.allele2);
            let (list1, list2) = (next.list(a1), next.list(a2));
            let mut candidates = Vec::new();
            self.distances.clear();

            if a1 != a2 {
                for (i1, h1) in list1.iter().enumerate() {
                    let mut i2 = 0;
                    while i2 < list2.len() {
                        if list2.len() - i2 >= 8 {
                            let batch = hamming_distance8(len, h1, &list2[i2..], genotype);
                            for (k, d) in batch.iter().enumerate() {
                                candidates.push(HaplotypePair::new(
                                    HaplotypeRef::new(a1, i1),
                                    HaplotypeRef::new(a2, i2 + k),
                                ));
                                self.distances.push(*d);
                            }
                            i2 += 8;
                        } else {
                            candidates.push(HaplotypePair::new(
                                HaplotypeRef::new(a1, i1),
                                HaplotypeRef::new(a2, i2),
                            ));
                            self.distances
                                .push(hamming_distance(len, h1, &list2[i2], genotype));
                            i2 += 1;
                        }
                    }
                }
            } else {
                for (i1, h1) in list1.iter().enumerate() {
                    for (i2, h2) in list1.iter().enumerate().skip(i1) {
                        candidates.push(HaplotypePair::new(
                            HaplotypeRef::new(a1, i1),
                            HaplotypeRef::new(a1, i2),
                        ));
                        self.distances.push(hamming_distance(len, h1, h2, genotype));
                    }
                }
            }

            let min_distance = self.distances.iter().copied().min().unwrap_or(0);
            let pairs: Vec<HaplotypePair> = candidates
                .into_iter()
                .zip(self.distances.iter())
                .filter(|(_, d)| **d == min_distance)
                .map(|(pair, _)| pair)
                .collect();
            let consistent = BitVec::new_fill(true, pairs.len() as u64);
            self.samples.push(SamplePairs {
                sample,
                bootstrap_count: genotype.bootstrap_count,
                pairs,
                consistent,
            });
        }
        Ok(next)
    }

    /// Seed `next` for the candidate marker and flag the retained pairs that agree with
    /// each individual's call there. Returns false when the marker is monomorphic among
    /// the in-bag individuals.
    pub fn prepare_new_marker(
        &mut self,
        marker: ArrayView1<Option<u8>>,
        genotypes: &GenotypeList,
        current: &HaplotypeSet,
        next: &mut HaplotypeSet,
    ) -> bool {
        let mut allele_count = 0u64;
        let mut valid_count = 0u64;
        for (genotype, call) in genotypes.genotypes().iter().zip(marker.iter()) {
            let weight = genotype.bootstrap_count as u64;
            if let Some(g) = call {
                allele_count += *g as u64 * weight;
                valid_count += 2 * weight;
            }
        }
        if allele_count == 0 || allele_count == valid_count {
            return false;
        }

        current.seed_doubled(
            next,
            allele_count as f64 / valid_count as f64,
            self.params.init_offset,
        );

        let new_idx = next.n_markers() - 1;
        for sample in self.samples.iter_mut() {
            match marker[sample.sample] {
                Some(g) => {
                    for (k, pair) in sample.pairs.iter().enumerate() {
                        let sum = next.list(pair.h1.allele)[pair.h1.index].allele(new_idx)
                            + next.list(pair.h2.allele)[pair.h2.index].allele(new_idx);
                        sample.consistent.set(k as u64, sum == g);
                    }
                }
                None => {
                    for k in 0..sample.pairs.len() {
                        sample.consistent.set(k as u64, true);
                    }
                }
            }
        }
        true
    }

    /// Fit the frequencies of `next` to the consistent pairs by maximum likelihood.
    /// Running into the iteration cap is not an error, the last estimate is kept.
    pub fn expectation_maximization(&mut self, next: &mut HaplotypeSet) -> EmSummary {
        let rel_tol = self.params.rel_tol;
        let mut conv_tol = 0.0;
        let mut log_lik = -1e30;
        let mut iterations = 0;
        let mut converged = false;

        for iteration in 0..=self.params.max_iterations {
            iterations = iteration + 1;
            let old_log_lik = log_lik;
            next.save_clear_frequency();

            let mut total_count = 0u64;
            log_lik = 0.0;
            for sample in self.samples.iter_mut() {
                total_count += sample.bootstrap_count as u64;
                let mut psum = 0.0;
                for (k, pair) in sample.pairs.iter_mut().enumerate() {
                    if sample.consistent[k as u64] {
                        let f1 = next.list(pair.h1.allele)[pair.h1.index].old_frequency;
                        let f2 = next.list(pair.h2.allele)[pair.h2.index].old_frequency;
                        pair.prob = if pair.h1 != pair.h2 {
                            2.0 * f1 * f2
                        } else {
                            f1 * f2
                        };
                        psum += pair.prob;
                    }
                }
                if psum <= 0.0 {
                    continue;
                }
                log_lik += sample.bootstrap_count as f64 * psum.ln();
                let scale = sample.bootstrap_count as f64 / psum;
                for (k, pair) in sample.pairs.iter().enumerate() {
                    if sample.consistent[k as u64] {
                        let r = pair.prob * scale;
                        next.list_mut(pair.h1.allele)[pair.h1.index].frequency += r;
                        next.list_mut(pair.h2.allele)[pair.h2.index].frequency += r;
                    }
                }
            }
            if total_count == 0 {
                break;
            }
            next.scale_frequency(0.5 / total_count as f64);

            if iteration > 0 {
                if (log_lik - old_log_lik).abs() <= conv_tol {
                    converged = true;
                    break;
                }
            } else {
                conv_tol = (rel_tol * (log_lik.abs() + rel_tol)).max(0.0);
            }
        }

        debug!(
            "EM finished after {} iteration(s), log-likelihood {:.6}, converged: {}",
            iterations, log_lik, converged
        );
        EmSummary::new(iterations, log_lik, converged)
    }

    /// Number of retained haplotype pairs for `sample`, None if it is out of bag.
    pub fn pair_count(&self, sample: usize) -> Option<usize> {
        self.samples
            .iter()
            .find(|s| s.sample == sample)
            .map(|s| s.pairs.len())
    }

    /// Number of retained pairs for `sample` agreeing with the candidate marker.
    pub fn consistent_pair_count(&self, sample: usize) -> Option<usize> {
        self.samples.iter().find(|s| s.sample == sample).map(|s| {
            (0..s.pairs.len() as u64)
                .filter(|&k| s.consistent[k])
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Haplotype;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::arr1;

    // X/X, X/Y, Y/Y; the marker separates X ('0') from Y ('1')
    fn separating_cohort() -> (GenotypeList, Vec<HlaPair>, ndarray::Array1<Option<u8>>) {
        let genotypes = GenotypeList::with_bootstrap(&[1, 1, 1]);
        let labels = vec![HlaPair::new(0, 0), HlaPair::new(0, 1), HlaPair::new(1, 1)];
        (genotypes, labels, arr1(&[Some(0), Some(1), Some(2)]))
    }

    #[test]
    fn monomorphic_marker_is_skipped() {
        let (genotypes, labels, _) = separating_cohort();
        let current = HaplotypeSet::initial(&[3, 3]);
        let mut em = EmEstimator::new(EmParams::default());
        let mut next = em.prepare_haplotypes(&current, &genotypes, &labels).unwrap();
        let marker = arr1(&[Some(2), Some(2), None]);
        assert!(!em.prepare_new_marker(marker.view(), &genotypes, &current, &mut next));
    }

    #[test]
    fn em_recovers_separating_haplotypes() {
        let (genotypes, labels, marker) = separating_cohort();
        let current = HaplotypeSet::initial(&[3, 3]);
        let mut em = EmEstimator::new(EmParams::default());
        let mut next = em.prepare_haplotypes(&current, &genotypes, &labels).unwrap();
        assert_eq!(em.pair_count(0), Some(3));
        assert_eq!(em.pair_count(1), Some(4));

        assert!(em.prepare_new_marker(marker.view(), &genotypes, &current, &mut next));
        assert_eq!(em.consistent_pair_count(0), Some(1));
        assert_eq!(em.consistent_pair_count(1), Some(2));
        assert_eq!(em.consistent_pair_count(2), Some(1));

        let summary = em.expectation_maximization(&mut next);
        assert!(summary.iterations > 1);
        assert_approx_eq!(next.total_frequency(), 1.0, 1e-9);

        let pruned = next.pruned_doubled(EmParams::default().rare_threshold(3), 1e-5);
        assert_approx_eq!(pruned.total_frequency(), 1.0, 1e-9);
        assert_eq!(pruned.list(0).len(), 1);
        assert_eq!(pruned.list(0)[0].to_bit_string(1).unwrap(), "0");
        assert_eq!(pruned.list(1).len(), 1);
        assert_eq!(pruned.list(1)[0].to_bit_string(1).unwrap(), "1");
        assert_approx_eq!(pruned.list(0)[0].frequency, 0.5, 1e-6);
    }

    #[test]
    fn out_of_bag_individuals_get_no_pairs() {
        let genotypes = GenotypeList::with_bootstrap(&[2, 0]);
        let labels = vec![HlaPair::new(0, 1), HlaPair::new(0, 0)];
        let current = HaplotypeSet::initial(&[2, 2]);
        let mut em = EmEstimator::new(EmParams::default());
        em.prepare_haplotypes(&current, &genotypes, &labels).unwrap();
        assert_eq!(em.pair_count(0), Some(4));
        assert_eq!(em.pair_count(1), None);
    }

    #[test]
    fn minimum_distance_pairs_are_kept_without_exact_match() {
        let mut current = HaplotypeSet::new(2, 1).unwrap();
        current
            .push(0, Haplotype::from_bit_string("0", 0.5).unwrap())
            .unwrap();
        current
            .push(1, Haplotype::from_bit_string("0", 0.5).unwrap())
            .unwrap();
        let mut genotypes = GenotypeList::with_bootstrap(&[1]);
        genotypes.add_marker(arr1(&[Some(2)]).view()).unwrap();
        let labels = vec![HlaPair::new(0, 1)];
        let mut em = EmEstimator::new(EmParams::default());
        em.prepare_haplotypes(&current, &genotypes, &labels).unwrap();
        // every doubled pair needs two mismatches at the first marker
        assert_eq!(em.pair_count(0), Some(4));
    }

    #[test]
    fn frequencies_sum_to_one_with_many_haplotypes() {
        let genotypes = GenotypeList::with_bootstrap(&[1, 2, 1, 1]);
        let labels = vec![
            HlaPair::new(0, 1),
            HlaPair::new(1, 1),
            HlaPair::new(0, 2),
            HlaPair::new(2, 2),
        ];
        let current = HaplotypeSet::initial(&[2, 5, 3]);
        let mut em = EmEstimator::new(EmParams::default());
        let mut next = em.prepare_haplotypes(&current, &genotypes, &labels).unwrap();
        let marker = arr1(&[Some(1), Some(0), None, Some(2)]);
        assert!(em.prepare_new_marker(marker.view(), &genotypes, &current, &mut next));
        em.expectation_maximization(&mut next);
        assert_approx_eq!(next.total_frequency(), 1.0, 1e-9);
    }
}
