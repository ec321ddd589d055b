//! Posterior probabilities of HLA allele pairs under one classifier, and the running
//! ensemble sum the classifiers vote into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::MAX_MARKERS;
use crate::errors::{Error, Result};
use crate::hla::{n_pairs, pair_index, pairs, HlaPair};
use crate::store::{hamming_distance, hamming_distance8, Genotype, HaplotypeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteMethod {
    /// average of the classifiers' posteriors, weighted by marker availability
    Prob,
    /// one vote per classifier for its best guess
    Majority,
}

impl Default for VoteMethod {
    fn default() -> Self {
        VoteMethod::Prob
    }
}

impl FromStr for VoteMethod {
    type Err = Error;

    fn from_str(method: &str) -> Result<VoteMethod> {
        match method {
            "prob" => Ok(VoteMethod::Prob),
            "majority" => Ok(VoteMethod::Majority),
            _ => Err(Error::InvalidVoteMethod(method.to_owned())),
        }
    }
}

impl fmt::Display for VoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteMethod::Prob => write!(f, "prob"),
            VoteMethod::Majority => write!(f, "majority"),
        }
    }
}

/// Argmax in (h1, h2) enumeration order; the first maximum wins, None if all are zero.
fn argmax(probs: &[f64], n_alleles: usize) -> Option<HlaPair> {
    let mut max = 0.0;
    let mut best = None;
    for (pair, &prob) in pairs(n_alleles).zip(probs) {
        if max < prob {
            max = prob;
            best = Some(pair);
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct Predictor {
    n_alleles: usize,
    /// kernel weight by number of allele mismatches
    penalty: Vec<f64>,
    post_prob: Vec<f64>,
    sum_post_prob: Vec<f64>,
    sum_weight: f64,
}

impl Predictor {
    /// `rare_freq` is the per-mismatch discount of the kernel.
    pub fn new(n_alleles: usize, rare_freq: f64) -> Self {
        let log_rare = rare_freq.ln();
        let penalty = (0..=2 * MAX_MARKERS)
            .map(|d| {
                let weight = (d as f64 * log_rare).exp();
                if weight.is_finite() {
                    weight
                } else {
                    0.0
                }
            })
            .collect();
        Predictor {
            n_alleles,
            penalty,
            post_prob: vec![0.0; n_pairs(n_alleles)],
            sum_post_prob: vec![0.0; n_pairs(n_alleles)],
            sum_weight: 0.0,
        }
    }

    pub fn n_alleles(&self) -> usize {
        self.n_alleles
    }

    pub fn post_prob(&self) -> &[f64] {
        &self.post_prob
    }

    pub fn sum_post_prob(&self) -> &[f64] {
        &self.sum_post_prob
    }

    pub fn sum_weight(&self) -> f64 {
        self.sum_weight
    }

    /// Unnormalized likelihood of the allele pair (h1, h2) given `genotype`.
    fn pair_score(&self, haplotypes: &HaplotypeSet, genotype: &Genotype, h1: usize, h2: usize) -> f64 {
        let len = haplotypes.n_markers();
        let list1 = haplotypes.list(h1);
        let mut score = 0.0;

        if h1 == h2 {
            for (i1, a) in list1.iter().enumerate() {
                for (k, b) in list1[i1..].iter().enumerate() {
                    let prior = if k == 0 {
                        a.frequency * b.frequency
                    } else {
                        2.0 * a.frequency * b.frequency
                    };
                    score += prior * self.penalty[hamming_distance(len, a, b, genotype) as usize];
                }
            }
            return score;
        }

        let list2 = haplotypes.list(h2);
        for a in list1 {
            let scale = 2.0 * a.frequency;
            let mut i2 = 0;
            while i2 < list2.len() {
                if list2.len() - i2 >= 8 {
                    let batch = hamming_distance8(len, a, &list2[i2..], genotype);
                    for (b, d) in list2[i2..i2 + 8].iter().zip(batch.iter()) {
                        score += scale * b.frequency * self.penalty[*d as usize];
                    }
                    i2 += 8;
                } else {
                    let b = &list2[i2];
                    score += scale
                        * b.frequency
                        * self.penalty[hamming_distance(len, a, b, genotype) as usize];
                    i2 += 1;
                }
            }
        }
        score
    }

    /// Fill the posterior buffer for `genotype`; an all-zero distribution stays zero.
    pub fn predict_post_prob(&mut self, haplotypes: &HaplotypeSet, genotype: &Genotype) -> &[f64] {
        debug_assert_eq!(haplotypes.n_alleles(), self.n_alleles);
        let mut sum = 0.0;
        for (idx, pair) in pairs(self.n_alleles).enumerate() {
            let score = self.pair_score(haplotypes, genotype, pair.allele1, pair.allele2);
            self.post_prob[idx] = score;
            sum += score;
        }
        if sum > 0.0 {
            for prob in self.post_prob.iter_mut() {
                *prob /= sum;
            }
        }
        &self.post_prob
    }

    /// Best guess from the posterior buffer.
    pub fn best_guess(&self) -> Option<HlaPair> {
        argmax(&self.post_prob, self.n_alleles)
    }

    /// Best guess computed pair by pair, without touching the posterior buffer.
    pub fn predict_best_guess(&self, haplotypes: &HaplotypeSet, genotype: &Genotype) -> Option<HlaPair> {
        let mut max = 0.0;
        let mut best = None;
        for pair in pairs(self.n_alleles) {
            let score = self.pair_score(haplotypes, genotype, pair.allele1, pair.allele2);
            if max < score {
                max = score;
                best = Some(pair);
            }
        }
        best
    }

    /// Normalized posterior of a single allele pair, zero when no pair has any support.
    pub fn label_posterior(&self, haplotypes: &HaplotypeSet, genotype: &Genotype, label: &HlaPair) -> f64 {
        let target = label.pair_index(self.n_alleles);
        let mut sum = 0.0;
        let mut label_score = 0.0;
        for (idx, pair) in pairs(self.n_alleles).enumerate() {
            let score = self.pair_score(haplotypes, genotype, pair.allele1, pair.allele2);
            if idx == target {
                label_score = score;
            }
            sum += score;
        }
        if sum > 0.0 {
            label_score / sum
        } else {
            0.0
        }
    }

    pub fn init_sum(&mut self) {
        self.sum_post_prob.iter_mut().for_each(|s| *s = 0.0);
        self.sum_weight = 0.0;
    }

    /// Add the posterior buffer, scaled by `weight`, to the ensemble sum.
    pub fn add_prob_to_sum(&mut self, weight: f64) {
        if weight > 0.0 {
            for (sum, prob) in self.sum_post_prob.iter_mut().zip(&self.post_prob) {
                *sum += prob * weight;
            }
            self.sum_weight += weight;
        }
    }

    /// Replace the posterior buffer by a one-hot vote for `pair` and add it with weight 1.
    pub fn add_vote_to_sum(&mut self, pair: &HlaPair) {
        self.post_prob.iter_mut().for_each(|p| *p = 0.0);
        self.post_prob[pair_index(pair.allele1, pair.allele2, self.n_alleles)] = 1.0;
        self.add_prob_to_sum(1.0);
    }

    pub fn normalize_sum(&mut self) {
        if self.sum_weight > 0.0 {
            let scale = 1.0 / self.sum_weight;
            for sum in self.sum_post_prob.iter_mut() {
                *sum *= scale;
            }
        }
    }

    pub fn best_guess_ensemble(&self) -> Option<HlaPair> {
        argmax(&self.sum_post_prob, self.n_alleles)
    }

    /// Ensemble probability of `pair`, zero for out-of-catalog pairs.
    pub fn sum_prob_of(&self, pair: &HlaPair) -> f64 {
        if pair.allele2 >= self.n_alleles {
            return 0.0;
        }
        self.sum_post_prob[pair.pair_index(self.n_alleles)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Haplotype;
    use assert_approx_eq::assert_approx_eq;

    fn two_allele_set() -> HaplotypeSet {
        let mut set = HaplotypeSet::new(2, 2).unwrap();
        set.push(0, Haplotype::from_bit_string("00", 0.4).unwrap())
            .unwrap();
        set.push(0, Haplotype::from_bit_string("01", 0.1).unwrap())
            .unwrap();
        set.push(1, Haplotype::from_bit_string("11", 0.5).unwrap())
            .unwrap();
        set
    }

    #[test]
    fn vote_method_parses() {
        assert_eq!("prob".parse::<VoteMethod>().unwrap(), VoteMethod::Prob);
        assert_eq!(
            "majority".parse::<VoteMethod>().unwrap(),
            VoteMethod::Majority
        );
        assert!(matches!(
            "mean".parse::<VoteMethod>(),
            Err(Error::InvalidVoteMethod(_))
        ));
    }

    #[test]
    fn exact_match_dominates_mismatching_pairs() {
        let set = two_allele_set();
        let genotype = Genotype::from_call_string("11").unwrap();
        let mut predictor = Predictor::new(2, 1e-5);
        let post = predictor.predict_post_prob(&set, &genotype).to_vec();
        assert_approx_eq!(post.iter().sum::<f64>(), 1.0, 1e-12);
        let exact = HlaPair::new(0, 1).pair_index(2);
        for (idx, p) in post.iter().enumerate() {
            assert!(post[exact] >= *p, "pair {} beats the exact match", idx);
        }
        assert_eq!(predictor.best_guess(), Some(HlaPair::new(0, 1)));
        assert_eq!(
            predictor.predict_best_guess(&set, &genotype),
            Some(HlaPair::new(0, 1))
        );
        assert_approx_eq!(
            predictor.label_posterior(&set, &genotype, &HlaPair::new(0, 1)),
            post[exact],
            1e-12
        );
    }

    #[test]
    fn missing_calls_carry_no_penalty() {
        let set = two_allele_set();
        let genotype = Genotype::from_call_string("??").unwrap();
        let mut predictor = Predictor::new(2, 1e-5);
        let post = predictor.predict_post_prob(&set, &genotype).to_vec();
        // pure priors: 0.25, 2 * 0.5 * 0.5, 0.25
        assert_approx_eq!(post[0], 0.25, 1e-12);
        assert_approx_eq!(post[1], 0.5, 1e-12);
        assert_approx_eq!(post[2], 0.25, 1e-12);
    }

    #[test]
    fn empty_set_has_no_best_guess() {
        let set = HaplotypeSet::new(3, 1).unwrap();
        let genotype = Genotype::from_call_string("1").unwrap();
        let mut predictor = Predictor::new(3, 1e-5);
        assert!(predictor
            .predict_post_prob(&set, &genotype)
            .iter()
            .all(|p| *p == 0.0));
        assert_eq!(predictor.best_guess(), None);
        assert_eq!(predictor.predict_best_guess(&set, &genotype), None);
        assert_eq!(
            predictor.label_posterior(&set, &genotype, &HlaPair::new(0, 0)),
            0.0
        );
    }

    #[test]
    fn ties_resolve_to_first_pair() {
        let mut predictor = Predictor::new(2, 1e-5);
        predictor.post_prob.copy_from_slice(&[0.0, 0.5, 0.5]);
        assert_eq!(predictor.best_guess(), Some(HlaPair::new(0, 1)));
    }

    #[test]
    fn ensemble_sum_is_weighted_average() {
        let set = two_allele_set();
        let mut predictor = Predictor::new(2, 1e-5);
        predictor.init_sum();
        predictor.predict_post_prob(&set, &Genotype::from_call_string("??").unwrap());
        predictor.add_prob_to_sum(0.5);
        predictor.add_vote_to_sum(&HlaPair::new(1, 1));
        predictor.add_prob_to_sum(0.0);
        predictor.normalize_sum();
        assert_approx_eq!(predictor.sum_weight(), 1.5);
        let sum = predictor.sum_post_prob();
        assert_approx_eq!(sum[0], 0.125 / 1.5, 1e-12);
        assert_approx_eq!(sum[2], (0.125 + 1.0) / 1.5, 1e-12);
        assert_approx_eq!(sum.iter().sum::<f64>(), 1.0, 1e-12);
        assert_eq!(predictor.best_guess_ensemble(), Some(HlaPair::new(1, 1)));
    }
}
