//! Attribute-bagging ensembles: the training cohort, bootstrap classifiers and the
//! ensemble vote over them.

use derive_new::new;
use log::{info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::fmt;

use crate::config::{EmParams, TrainingParams, MIN_RARE_FREQ};
use crate::errors::{Error, Result};
use crate::hla::{n_pairs, AlleleCatalog, HlaPair, MarkerCatalog};
use crate::prediction::{Predictor, VoteMethod};
use crate::selection::{MarkerSampler, VariableSelection};
use crate::store::{Genotype, HaplotypeSet};

/// Labeled training individuals: one row of marker calls and one allele pair each.
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    genotypes: Array2<Option<u8>>,
    labels: Vec<HlaPair>,
}

impl Cohort {
    pub fn new(genotypes: Array2<Option<u8>>, labels: Vec<HlaPair>, n_alleles: usize) -> Result<Self> {
        if genotypes.nrows() != labels.len() {
            return Err(Error::invalid_index(
                labels.len(),
                genotypes.nrows(),
                "Cohort::new, one label per genotype row",
            ));
        }
        if let Some(label) = labels.iter().find(|label| label.allele2 >= n_alleles) {
            return Err(Error::invalid_index(
                label.allele2,
                n_alleles,
                "Cohort::new, label outside the allele catalog",
            ));
        }
        if let Some(call) = genotypes.iter().flatten().find(|call| **call > 2) {
            return Err(Error::invalid_value(
                call,
                "genotype calls are 0, 1, 2 or missing",
            ));
        }
        Ok(Cohort { genotypes, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_markers(&self) -> usize {
        self.genotypes.ncols()
    }

    pub fn labels(&self) -> &[HlaPair] {
        &self.labels
    }

    pub fn genotypes(&self) -> ArrayView2<Option<u8>> {
        self.genotypes.view()
    }

    /// Calls of all individuals at `marker`.
    pub fn marker(&self, marker: usize) -> ArrayView1<Option<u8>> {
        self.genotypes.column(marker)
    }
}

fn check_min_rare_freq(min_rare_freq: f64) -> Result<()> {
    if min_rare_freq > 0.0 && min_rare_freq < 1.0 {
        Ok(())
    } else {
        Err(Error::invalid_value(
            min_rare_freq,
            "rare frequency floor must lie in (0, 1)",
        ))
    }
}

/// Draw `n` individuals with replacement until at least one is left out of bag.
pub fn bootstrap_counts<R: Rng>(n: usize, rng: &mut R) -> Result<Vec<u32>> {
    if n < 2 {
        return Err(Error::InsufficientCohort { n });
    }
    loop {
        let mut counts = vec![0u32; n];
        for _ in 0..n {
            counts[rng.gen_range(0..n)] += 1;
        }
        if counts.iter().any(|count| *count == 0) {
            return Ok(counts);
        }
    }
}

#[derive(Debug, Clone, PartialEq, new)]
pub struct Classifier {
    pub markers: Vec<usize>,
    pub haplotypes: HaplotypeSet,
    pub bootstrap_counts: Vec<u32>,
    pub oob_accuracy: f64,
}

impl Classifier {
    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    /// Number of panel markers called in `row`.
    fn usable_markers(&self, row: ArrayView1<Option<u8>>) -> usize {
        self.markers.iter().filter(|&&m| row[m].is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    /// ensemble best guess, None where no classifier could vote
    pub calls: Vec<Option<HlaPair>>,
    /// ensemble probability of each call, 0 without a call
    pub probs: Vec<f64>,
    /// individuals × allele pairs in (h1, h2) enumeration order
    pub posterior: Option<Array2<f64>>,
    /// individuals with no called marker in any classifier panel
    pub n_unusable: usize,
}

#[derive(Debug)]
struct IndividualPrediction {
    call: Option<HlaPair>,
    prob: f64,
    posterior: Option<Vec<f64>>,
    usable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub n_classifiers: usize,
    pub mean_oob_accuracy: f64,
    pub mean_markers: f64,
    pub mean_haplotypes: f64,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} classifier(s), mean OOB accuracy {:.2}%, mean panel size {:.1}, mean haplotype count {:.1}",
            self.n_classifiers,
            self.mean_oob_accuracy * 100.0,
            self.mean_markers,
            self.mean_haplotypes
        )
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    markers: MarkerCatalog,
    alleles: AlleleCatalog,
    cohort: Option<Cohort>,
    classifiers: Vec<Classifier>,
    /// rarity floor the classifiers were searched with, also the mismatch discount
    min_rare_freq: f64,
}

impl Model {
    pub fn new(markers: MarkerCatalog, alleles: AlleleCatalog, cohort: Cohort) -> Result<Self> {
        if cohort.n_markers() != markers.len() {
            return Err(Error::invalid_index(
                cohort.n_markers(),
                markers.len(),
                "Model::new, cohort columns differ from the marker catalog",
            ));
        }
        Ok(Model {
            markers,
            alleles,
            cohort: Some(cohort),
            classifiers: Vec::new(),
            min_rare_freq: MIN_RARE_FREQ,
        })
    }

    /// Reassemble a model from its catalogs and trained classifiers.
    pub fn from_parts(
        markers: MarkerCatalog,
        alleles: AlleleCatalog,
        classifiers: Vec<Classifier>,
    ) -> Result<Self> {
        let mut model = Model {
            markers,
            alleles,
            cohort: None,
            classifiers: Vec::with_capacity(classifiers.len()),
            min_rare_freq: MIN_RARE_FREQ,
        };
        for classifier in classifiers {
            model.add_classifier(classifier)?;
        }
        Ok(model)
    }

    pub fn markers(&self) -> &MarkerCatalog {
        &self.markers
    }

    pub fn alleles(&self) -> &AlleleCatalog {
        &self.alleles
    }

    pub fn cohort(&self) -> Option<&Cohort> {
        self.cohort.as_ref()
    }

    pub fn classifiers(&self) -> &[Classifier] {
        &self.classifiers
    }

    pub fn n_classifiers(&self) -> usize {
        self.classifiers.len()
    }

    pub fn min_rare_freq(&self) -> f64 {
        self.min_rare_freq
    }

    /// Set the rarity floor used to score genotypes; it has to be the one the
    /// classifiers were trained with.
    pub fn with_min_rare_freq(mut self, min_rare_freq: f64) -> Result<Self> {
        check_min_rare_freq(min_rare_freq)?;
        self.min_rare_freq = min_rare_freq;
        Ok(self)
    }

    fn training_cohort(&self) -> Result<&Cohort> {
        self.cohort.as_ref().ok_or(Error::MissingCohort)
    }

    pub fn add_classifier(&mut self, classifier: Classifier) -> Result<()> {
        if let Some(&marker) = classifier.markers.iter().find(|&&m| m >= self.markers.len()) {
            return Err(Error::invalid_index(
                marker,
                self.markers.len(),
                "Model::add_classifier, marker outside the catalog",
            ));
        }
        if classifier.haplotypes.n_markers() != classifier.markers.len() {
            return Err(Error::invalid_index(
                classifier.haplotypes.n_markers(),
                classifier.markers.len(),
                "Model::add_classifier, haplotype length differs from the panel",
            ));
        }
        if classifier.haplotypes.n_alleles() != self.alleles.len() {
            return Err(Error::invalid_index(
                classifier.haplotypes.n_alleles(),
                self.alleles.len(),
                "Model::add_classifier, haplotype lists differ from the allele catalog",
            ));
        }
        self.classifiers.push(classifier);
        Ok(())
    }

    /// Multiplicities of a fresh bootstrap draw over the cohort.
    pub fn new_classifier_bootstrap<R: Rng>(&self, rng: &mut R) -> Result<Vec<u32>> {
        bootstrap_counts(self.training_cohort()?.len(), rng)
    }

    /// Grow a classifier from explicit multiplicities, e.g. all ones for a classifier
    /// trained on the whole cohort.
    pub fn grow_classifier<R: Rng>(
        &self,
        bootstrap_counts: &[u32],
        mtry: usize,
        prune: bool,
        em: &EmParams,
        rng: &mut R,
    ) -> Result<Classifier> {
        let cohort = self.training_cohort()?;
        let mut selection =
            VariableSelection::new(cohort, self.alleles.len(), bootstrap_counts, em.clone())?;
        let mut sampler = MarkerSampler::new(self.markers.len());
        let outcome = selection.search(&mut sampler, mtry, prune, rng)?;
        Ok(Classifier::new(
            outcome.markers,
            outcome.haplotypes,
            bootstrap_counts.to_vec(),
            outcome.oob_accuracy,
        ))
    }

    /// Append `params.n_classifiers` bootstrap classifiers. Classifier k of the model
    /// draws from the seeded generator advanced by k jumps, so the ensemble does not
    /// depend on the number of threads or on how many rounds it was built in. Without
    /// a seed one is drawn from system entropy and logged.
    ///
    /// The first build fixes the model's rarity floor to `params.em.min_rare_freq`,
    /// later builds have to use the same floor.
    pub fn build_classifiers(&mut self, params: &TrainingParams) -> Result<()> {
        let cohort = self.training_cohort()?;
        if cohort.len() < 2 {
            return Err(Error::InsufficientCohort { n: cohort.len() });
        }
        check_min_rare_freq(params.em.min_rare_freq)?;
        if self.classifiers.is_empty() {
            self.min_rare_freq = params.em.min_rare_freq;
        } else if self.min_rare_freq != params.em.min_rare_freq {
            return Err(Error::ModelMismatch(format!(
                "classifiers were trained with rare frequency floor {}, not {}",
                self.min_rare_freq, params.em.min_rare_freq
            )));
        }
        let mtry = params.mtry.resolve(self.markers.len());
        let offset = self.classifiers.len();

        let seed = match params.seed {
            Some(seed) => seed,
            None => {
                let seed = rand::random::<u64>();
                info!("no seed given, drawing classifiers with seed {}", seed);
                seed
            }
        };
        let mut generator = Xoshiro256PlusPlus::seed_from_u64(seed);
        for _ in 0..offset {
            generator.jump();
        }
        let streams: Vec<Xoshiro256PlusPlus> = (0..params.n_classifiers)
            .map(|_| {
                let stream = generator.clone();
                generator.jump();
                stream
            })
            .collect();

        let model: &Model = self;
        let build = |(k, mut rng): (usize, Xoshiro256PlusPlus)| -> Result<Classifier> {
            let counts = model.new_classifier_bootstrap(&mut rng)?;
            let classifier = model.grow_classifier(&counts, mtry, params.prune, &params.em, &mut rng)?;
            info!(
                "classifier {}: OOB accuracy {:.2}%, {} marker(s), {} haplotype(s)",
                offset + k + 1,
                classifier.oob_accuracy * 100.0,
                classifier.n_markers(),
                classifier.haplotypes.total_haplotypes()
            );
            Ok(classifier)
        };

        let built: Vec<Classifier> = match params.threads {
            None => streams
                .into_iter()
                .enumerate()
                .map(&build)
                .collect::<Result<_>>()?,
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()?;
                pool.install(|| {
                    streams
                        .into_par_iter()
                        .enumerate()
                        .map(&build)
                        .collect::<Result<_>>()
                })?
            }
        };
        self.classifiers.extend(built);
        Ok(())
    }

    /// Concatenate the classifiers of `other`; both models must share their catalogs
    /// and rarity floor. Returns how many of the added classifiers were already present,
    /// which happens when both models were trained from the same seed.
    pub fn merge(&mut self, other: Model) -> Result<usize> {
        if self.markers != other.markers {
            return Err(Error::ModelMismatch("marker catalogs differ".to_owned()));
        }
        if self.alleles != other.alleles {
            return Err(Error::ModelMismatch("allele catalogs differ".to_owned()));
        }
        if self.min_rare_freq != other.min_rare_freq {
            return Err(Error::ModelMismatch(format!(
                "rare frequency floors differ ({} and {})",
                self.min_rare_freq, other.min_rare_freq
            )));
        }
        let duplicates = other
            .classifiers
            .iter()
            .filter(|classifier| self.classifiers.contains(classifier))
            .count();
        if duplicates > 0 {
            warn!(
                "{} of {} merged classifier(s) are already in the ensemble, were the models trained with the same seed?",
                duplicates,
                other.classifiers.len()
            );
        }
        if self.cohort.is_none() {
            self.cohort = other.cohort;
        }
        self.classifiers.extend(other.classifiers);
        Ok(duplicates)
    }

    fn predict_individual(
        &self,
        predictor: &mut Predictor,
        row: ArrayView1<Option<u8>>,
        vote: VoteMethod,
        with_posterior: bool,
    ) -> Result<IndividualPrediction> {
        predictor.init_sum();
        let mut usable = false;
        for classifier in &self.classifiers {
            let n_usable = classifier.usable_markers(row);
            if n_usable == 0 {
                continue;
            }
            usable = true;
            let genotype = Genotype::from_calls(row, &classifier.markers)?;
            predictor.predict_post_prob(&classifier.haplotypes, &genotype);
            match vote {
                VoteMethod::Prob => {
                    predictor.add_prob_to_sum(n_usable as f64 / classifier.n_markers() as f64)
                }
                VoteMethod::Majority => {
                    if let Some(pair) = predictor.best_guess() {
                        predictor.add_vote_to_sum(&pair);
                    }
                }
            }
        }
        predictor.normalize_sum();

        let call = predictor.best_guess_ensemble();
        Ok(IndividualPrediction {
            call,
            prob: call.map_or(0.0, |pair| predictor.sum_prob_of(&pair)),
            posterior: if with_posterior {
                Some(predictor.sum_post_prob().to_vec())
            } else {
                None
            },
            usable,
        })
    }

    /// Ensemble prediction for each row of `genotypes` (individuals × catalog markers).
    /// Individuals are scored in parallel on the current rayon pool; call it inside
    /// `ThreadPool::install` to bound the number of threads.
    pub fn predict(
        &self,
        genotypes: ArrayView2<Option<u8>>,
        vote: VoteMethod,
        with_posterior: bool,
    ) -> Result<Predictions> {
        if genotypes.ncols() != self.markers.len() {
            return Err(Error::invalid_index(
                genotypes.ncols(),
                self.markers.len(),
                "Model::predict, genotype columns differ from the marker catalog",
            ));
        }
        let n_alleles = self.alleles.len();
        let individuals: Vec<IndividualPrediction> = (0..genotypes.nrows())
            .into_par_iter()
            .map_init(
                || Predictor::new(n_alleles, self.min_rare_freq),
                |predictor, i| self.predict_individual(predictor, genotypes.row(i), vote, with_posterior),
            )
            .collect::<Result<_>>()?;

        let n_unusable = individuals.iter().filter(|p| !p.usable).count();
        if n_unusable > 0 {
            warn!(
                "{}, left uncalled",
                Error::NoUsableMarkers {
                    n_individuals: n_unusable
                }
            );
        }
        let posterior = if with_posterior {
            let mut posterior = Array2::<f64>::zeros((individuals.len(), n_pairs(n_alleles)));
            for (mut row, individual) in posterior.outer_iter_mut().zip(&individuals) {
                if let Some(probs) = &individual.posterior {
                    row.assign(&ArrayView1::from(probs.as_slice()));
                }
            }
            Some(posterior)
        } else {
            None
        };
        Ok(Predictions {
            calls: individuals.iter().map(|p| p.call).collect(),
            probs: individuals.iter().map(|p| p.prob).collect(),
            posterior,
            n_unusable,
        })
    }

    /// Allele-level accuracy of the ensemble on a labeled cohort.
    pub fn evaluate(&self, cohort: &Cohort, vote: VoteMethod) -> Result<f64> {
        if cohort.is_empty() {
            return Ok(1.0);
        }
        let predictions = self.predict(cohort.genotypes(), vote, false)?;
        let matched: usize = predictions
            .calls
            .iter()
            .zip(cohort.labels())
            .map(|(call, truth)| call.map_or(0, |pair| pair.matching_alleles(truth)))
            .sum();
        Ok(matched as f64 / (2 * cohort.len()) as f64)
    }

    /// Number of classifiers using each catalog marker.
    pub fn marker_usage(&self) -> Vec<usize> {
        let mut usage = vec![0; self.markers.len()];
        for classifier in &self.classifiers {
            for &marker in &classifier.markers {
                usage[marker] += 1;
            }
        }
        usage
    }

    pub fn summary(&self) -> ModelSummary {
        let n = self.classifiers.len().max(1) as f64;
        let (mut accuracy, mut markers, mut haplotypes) = (0.0, 0.0, 0.0);
        for classifier in &self.classifiers {
            accuracy += classifier.oob_accuracy;
            markers += classifier.n_markers() as f64;
            haplotypes += classifier.haplotypes.total_haplotypes() as f64;
        }
        ModelSummary {
            n_classifiers: self.classifiers.len(),
            mean_oob_accuracy: accuracy / n,
            mean_markers: markers / n,
            mean_haplotypes: haplotypes / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tiny_model() -> Model {
        let genotypes = array![
            [Some(0), Some(1)],
            [Some(1), None],
            [Some(2), Some(1)]
        ];
        let labels = vec![HlaPair::new(0, 0), HlaPair::new(0, 1), HlaPair::new(1, 1)];
        let cohort = Cohort::new(genotypes, labels, 2).unwrap();
        Model::new(
            MarkerCatalog::from_ids(vec!["rs1".to_owned(), "rs2".to_owned()]),
            AlleleCatalog::new(vec!["01:01".to_owned(), "02:01".to_owned()]),
            cohort,
        )
        .unwrap()
    }

    #[test]
    fn cohort_rejects_inconsistent_input() {
        let genotypes = array![[Some(0)], [Some(3)]];
        let labels = vec![HlaPair::new(0, 0), HlaPair::new(0, 1)];
        assert!(matches!(
            Cohort::new(genotypes, labels.clone(), 2),
            Err(Error::InvalidValue { .. })
        ));
        assert!(Cohort::new(array![[Some(0)]], labels.clone(), 2).is_err());
        assert!(Cohort::new(array![[Some(0)], [None]], labels, 1).is_err());
    }

    #[test]
    fn bootstrap_always_leaves_individuals_out() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        for n in 2..12 {
            for _ in 0..50 {
                let counts = bootstrap_counts(n, &mut rng).unwrap();
                assert_eq!(counts.iter().sum::<u32>() as usize, n);
                assert!(counts.contains(&0));
            }
        }
        assert!(matches!(
            bootstrap_counts(1, &mut rng),
            Err(Error::InsufficientCohort { n: 1 })
        ));
    }

    #[test]
    fn merge_requires_identical_catalogs() {
        let mut model = tiny_model();
        let mut other = tiny_model();
        other.alleles = AlleleCatalog::new(vec!["01:01".to_owned(), "03:01".to_owned()]);
        assert!(matches!(model.merge(other), Err(Error::ModelMismatch(_))));
        let coarse = tiny_model().with_min_rare_freq(0.01).unwrap();
        assert!(matches!(model.merge(coarse), Err(Error::ModelMismatch(_))));
        assert_eq!(model.merge(tiny_model()).unwrap(), 0);
    }

    #[test]
    fn rare_floor_is_fixed_by_the_first_build() {
        let mut model = tiny_model();
        let mut params = TrainingParams {
            n_classifiers: 1,
            seed: Some(3),
            ..TrainingParams::default()
        };
        params.em.min_rare_freq = 0.01;
        model.build_classifiers(&params).unwrap();
        assert_eq!(model.min_rare_freq(), 0.01);

        params.em.min_rare_freq = 1e-5;
        assert!(matches!(
            model.build_classifiers(&params),
            Err(Error::ModelMismatch(_))
        ));
        params.em.min_rare_freq = 0.0;
        assert!(matches!(
            tiny_model().build_classifiers(&params),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn classifiers_must_fit_the_catalogs() {
        let mut model = tiny_model();
        let haplotypes = HaplotypeSet::new(2, 1).unwrap();
        assert!(model
            .add_classifier(Classifier::new(vec![2], haplotypes.clone(), vec![1, 1, 0], 1.0))
            .is_err());
        assert!(model
            .add_classifier(Classifier::new(vec![0, 1], haplotypes.clone(), vec![1, 1, 0], 1.0))
            .is_err());
        assert!(model
            .add_classifier(Classifier::new(vec![1], haplotypes, vec![1, 1, 0], 1.0))
            .is_ok());
        assert_eq!(model.marker_usage(), vec![0, 1]);
    }

    #[test]
    fn unusable_individuals_are_counted() {
        let mut model = tiny_model();
        model.build_classifiers(&TrainingParams {
            n_classifiers: 2,
            ..TrainingParams::default()
        })
        .unwrap();
        let query = array![[None, None], [Some(0), Some(1)]];
        let predictions = model.predict(query.view(), VoteMethod::Prob, true).unwrap();
        assert_eq!(predictions.calls[0], None);
        assert_eq!(predictions.probs[0], 0.0);
        let usable_classifiers = model.classifiers().iter().filter(|c| c.n_markers() > 0).count();
        assert_eq!(predictions.n_unusable, if usable_classifiers > 0 { 1 } else { 2 });
        let posterior = predictions.posterior.unwrap();
        assert_eq!(posterior.dim(), (2, 3));
        assert!(posterior.row(0).iter().all(|p| *p == 0.0));
    }

    #[test]
    fn training_needs_a_cohort() {
        let mut model = Model::from_parts(
            MarkerCatalog::from_ids(vec!["rs1".to_owned()]),
            AlleleCatalog::new(vec!["01:01".to_owned()]),
            Vec::new(),
        )
        .unwrap();
        assert!(matches!(
            model.build_classifiers(&TrainingParams::default()),
            Err(Error::MissingCohort)
        ));
    }

    #[test]
    fn summary_of_empty_model() {
        let summary = tiny_model().summary();
        assert_eq!(summary.n_classifiers, 0);
        assert_eq!(summary.mean_oob_accuracy, 0.0);
    }
}
