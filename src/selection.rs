//! Greedy growth of one classifier's marker panel, driven by out-of-bag accuracy.

use log::debug;
use ndarray::ArrayView1;
use rand::Rng;

use crate::config::{EmParams, MAX_MARKERS, PRUNE_RELTOL, STOP_RELTOL_ADD_MARKER};
use crate::em::EmEstimator;
use crate::errors::{Error, Result};
use crate::model::Cohort;
use crate::prediction::Predictor;
use crate::store::{GenotypeList, HaplotypeSet};

/// Candidate marker pool, sampled without replacement. The current selection lives at
/// the tail of the pool; `None` flags a selected marker for removal.
#[derive(Debug, Clone)]
pub struct MarkerSampler {
    pool: Vec<Option<usize>>,
    n_selected: usize,
}

impl MarkerSampler {
    pub fn new(n_markers: usize) -> Self {
        MarkerSampler {
            pool: (0..n_markers).map(Some).collect(),
            n_selected: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Move `mtry` randomly chosen markers to the tail; with `mtry` covering the whole
    /// pool everything is selected in place.
    pub fn random_select<R: Rng>(&mut self, mtry: usize, rng: &mut R) {
        let n = self.pool.len();
        let mtry = mtry.min(n);
        if mtry < n {
            for i in 0..mtry {
                let pick = rng.gen_range(0..n - i);
                self.pool.swap(pick, n - i - 1);
            }
        }
        self.n_selected = mtry;
    }

    pub fn n_selected(&self) -> usize {
        self.n_selected
    }

    fn position(&self, i: usize) -> usize {
        debug_assert!(i < self.n_selected);
        self.pool.len() - self.n_selected + i
    }

    /// Marker of the `i`-th selected slot, None once flagged.
    pub fn selected(&self, i: usize) -> Option<usize> {
        self.pool[self.position(i)]
    }

    pub fn flag(&mut self, i: usize) {
        let pos = self.position(i);
        self.pool[pos] = None;
    }

    /// Drop the `i`-th selected marker, the rest of the selection returns to the pool.
    pub fn remove(&mut self, i: usize) {
        let pos = self.position(i);
        self.pool.remove(pos);
        self.n_selected = 0;
    }

    /// Drop the whole selection.
    pub fn remove_selection(&mut self) {
        let keep = self.pool.len() - self.n_selected;
        self.pool.truncate(keep);
        self.n_selected = 0;
    }

    /// Drop the flagged markers of the selection, the others return to the pool.
    pub fn remove_flagged(&mut self) {
        let start = self.pool.len() - self.n_selected;
        let mut idx = start;
        while idx < self.pool.len() {
            if self.pool[idx].is_none() {
                self.pool.remove(idx);
            } else {
                idx += 1;
            }
        }
        self.n_selected = 0;
    }

    pub fn remaining(&self) -> Vec<usize> {
        self.pool.iter().filter_map(|m| *m).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub haplotypes: HaplotypeSet,
    pub markers: Vec<usize>,
    pub oob_accuracy: f64,
}

/// Working state of one panel search: the cohort's genotypes over the growing panel,
/// weighted by one bootstrap draw.
#[derive(Debug)]
pub struct VariableSelection<'a> {
    cohort: &'a Cohort,
    n_alleles: usize,
    genotypes: GenotypeList,
    em: EmEstimator,
    predictor: Predictor,
    panel_limit: usize,
}

impl<'a> VariableSelection<'a> {
    pub fn new(
        cohort: &'a Cohort,
        n_alleles: usize,
        bootstrap_counts: &[u32],
        em_params: EmParams,
    ) -> Result<Self> {
        if bootstrap_counts.len() != cohort.len() {
            return Err(Error::invalid_index(
                bootstrap_counts.len(),
                cohort.len(),
                "VariableSelection::new, one bootstrap count per individual",
            ));
        }
        let predictor = Predictor::new(n_alleles, em_params.min_rare_freq);
        Ok(VariableSelection {
            cohort,
            n_alleles,
            genotypes: GenotypeList::with_bootstrap(bootstrap_counts),
            em: EmEstimator::new(em_params),
            predictor,
            // the last panel bit stays free
            panel_limit: MAX_MARKERS - 1,
        })
    }

    pub fn panel_limit(&self) -> usize {
        self.panel_limit
    }

    /// Stop the search once `limit` markers are selected, at most `MAX_MARKERS - 1`.
    pub fn set_panel_limit(&mut self, limit: usize) -> Result<()> {
        if limit == 0 || limit >= MAX_MARKERS {
            return Err(Error::invalid_index(
                limit,
                MAX_MARKERS,
                "VariableSelection::set_panel_limit",
            ));
        }
        self.panel_limit = limit;
        Ok(())
    }

    fn initial_haplotypes(&self) -> HaplotypeSet {
        let mut counts = vec![0u64; self.n_alleles];
        for (genotype, label) in self.genotypes.genotypes().iter().zip(self.cohort.labels()) {
            counts[label.allele1] += genotype.bootstrap_count as u64;
            counts[label.allele2] += genotype.bootstrap_count as u64;
        }
        HaplotypeSet::initial(&counts)
    }

    /// Fraction of correctly recovered alleles among out-of-bag individuals, 1 without any.
    pub fn out_of_bag_accuracy(&self, haplotypes: &HaplotypeSet) -> f64 {
        let mut total = 0;
        let mut correct = 0;
        for (genotype, label) in self.genotypes.genotypes().iter().zip(self.cohort.labels()) {
            if genotype.bootstrap_count == 0 {
                if let Some(guess) = self.predictor.predict_best_guess(haplotypes, genotype) {
                    correct += guess.matching_alleles(label);
                }
                total += 2;
            }
        }
        if total > 0 {
            correct as f64 / total as f64
        } else {
            1.0
        }
    }

    /// -2 log-likelihood of the in-bag labels.
    pub fn in_bag_deviance(&self, haplotypes: &HaplotypeSet) -> f64 {
        let log_lik: f64 = self
            .genotypes
            .genotypes()
            .iter()
            .zip(self.cohort.labels())
            .filter(|(genotype, _)| genotype.bootstrap_count > 0)
            .map(|(genotype, label)| {
                genotype.bootstrap_count as f64
                    * self
                        .predictor
                        .label_posterior(haplotypes, genotype, label)
                        .ln()
            })
            .sum();
        -2.0 * log_lik
    }

    pub fn search<R: Rng>(
        &mut self,
        sampler: &mut MarkerSampler,
        mtry: usize,
        prune: bool,
        rng: &mut R,
    ) -> Result<SearchOutcome> {
        let cohort = self.cohort;
        let rare_freq = self.em.params().rare_threshold(cohort.len());
        let min_freq = self.em.params().min_rare_freq;

        let mut haplotypes = self.initial_haplotypes();
        let mut markers: Vec<usize> = Vec::new();
        let mut global_acc = 0.0;
        let mut global_loss = 1e30;

        while !sampler.is_empty() && markers.len() < self.panel_limit {
            let mut next = self
                .em
                .prepare_haplotypes(&haplotypes, &self.genotypes, cohort.labels())?;

            let mut max_acc = global_acc;
            let mut min_loss = global_loss;
            let mut best: Option<(usize, usize, HaplotypeSet)> = None;

            sampler.random_select(mtry, rng);
            for i in 0..sampler.n_selected() {
                let marker = match sampler.selected(i) {
                    Some(marker) => marker,
                    None => continue,
                };
                let column: ArrayView1<Option<u8>> = cohort.marker(marker);
                if !self
                    .em
                    .prepare_new_marker(column, &self.genotypes, &haplotypes, &mut next)
                {
                    continue;
                }
                self.em.expectation_maximization(&mut next);
                let reduced = next.pruned_doubled(rare_freq, min_freq);

                self.genotypes.add_marker(column)?;
                let acc = self.out_of_bag_accuracy(&reduced);
                let loss = if acc >= max_acc {
                    self.in_bag_deviance(&reduced)
                } else {
                    0.0
                };
                self.genotypes.remove_last_marker();

                let mut chosen = false;
                if acc > max_acc || (acc == max_acc && loss < min_loss) {
                    max_acc = acc;
                    min_loss = loss;
                    best = Some((i, marker, reduced));
                    chosen = true;
                }

                if prune {
                    let evict = acc < global_acc
                        || (acc == global_acc
                            && loss > global_loss * (1.0 + PRUNE_RELTOL)
                            && !chosen);
                    if evict {
                        sampler.flag(i);
                    }
                }
            }

            let accept = if max_acc > global_acc {
                true
            } else if max_acc == global_acc && best.is_some() {
                min_loss >= STOP_RELTOL_ADD_MARKER
                    && min_loss < global_loss * (1.0 - STOP_RELTOL_ADD_MARKER)
            } else {
                false
            };

            match best {
                Some((i, marker, reduced)) if accept => {
                    global_acc = max_acc;
                    global_loss = min_loss;
                    haplotypes = reduced;
                    markers.push(marker);
                    self.genotypes.add_marker(cohort.marker(marker))?;
                    if prune {
                        sampler.flag(i);
                        sampler.remove_flagged();
                    } else {
                        sampler.remove(i);
                    }
                    debug!(
                        "added marker {} as #{}: loss {:.6}, OOB accuracy {:.2}%, {} haplotype(s)",
                        marker,
                        markers.len(),
                        global_loss,
                        global_acc * 100.0,
                        haplotypes.total_haplotypes()
                    );
                }
                _ => sampler.remove_selection(),
            }
        }

        Ok(SearchOutcome {
            haplotypes,
            markers,
            oob_accuracy: global_acc,
        })
    }
}
