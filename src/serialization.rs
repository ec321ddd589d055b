//! Persisted form of a trained ensemble. A record carries the catalogs and every
//! classifier, haplotypes written as '0'/'1' strings; records of models sharing their
//! catalogs merge by concatenating the classifier lists.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::config::MIN_RARE_FREQ;
use crate::errors::{Error, Result};
use crate::hla::{AlleleCatalog, MarkerCatalog};
use crate::model::{Classifier, Model};
use crate::store::{Haplotype, HaplotypeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaplotypeRecord {
    pub allele: usize,
    pub haplotype: String,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRecord {
    pub markers: Vec<usize>,
    pub haplotypes: Vec<HaplotypeRecord>,
    pub bootstrap_counts: Vec<u32>,
    pub oob_accuracy: f64,
}

impl ClassifierRecord {
    pub fn from_classifier(classifier: &Classifier) -> Result<Self> {
        let len = classifier.n_markers();
        let mut haplotypes = Vec::with_capacity(classifier.haplotypes.total_haplotypes());
        for (allele, list) in classifier.haplotypes.lists().iter().enumerate() {
            for haplotype in list {
                haplotypes.push(HaplotypeRecord {
                    allele,
                    haplotype: haplotype.to_bit_string(len)?,
                    frequency: haplotype.frequency,
                });
            }
        }
        Ok(ClassifierRecord {
            markers: classifier.markers.clone(),
            haplotypes,
            bootstrap_counts: classifier.bootstrap_counts.clone(),
            oob_accuracy: classifier.oob_accuracy,
        })
    }

    pub fn into_classifier(self, n_alleles: usize) -> Result<Classifier> {
        let len = self.markers.len();
        let mut set = HaplotypeSet::new(n_alleles, len)?;
        for record in self.haplotypes {
            if record.haplotype.len() != len {
                return Err(Error::invalid_value(
                    record.haplotype,
                    "haplotype string length differs from the classifier panel",
                ));
            }
            set.push(
                record.allele,
                Haplotype::from_bit_string(&record.haplotype, record.frequency)?,
            )?;
        }
        Ok(Classifier::new(
            self.markers,
            set,
            self.bootstrap_counts,
            self.oob_accuracy,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub markers: MarkerCatalog,
    pub alleles: AlleleCatalog,
    #[serde(default = "default_min_rare_freq")]
    pub min_rare_freq: f64,
    pub classifiers: Vec<ClassifierRecord>,
}

fn default_min_rare_freq() -> f64 {
    MIN_RARE_FREQ
}

impl ModelRecord {
    pub fn from_model(model: &Model) -> Result<Self> {
        Ok(ModelRecord {
            markers: model.markers().clone(),
            alleles: model.alleles().clone(),
            min_rare_freq: model.min_rare_freq(),
            classifiers: model
                .classifiers()
                .iter()
                .map(ClassifierRecord::from_classifier)
                .collect::<Result<_>>()?,
        })
    }

    pub fn into_model(self) -> Result<Model> {
        let n_alleles = self.alleles.len();
        let classifiers = self
            .classifiers
            .into_iter()
            .map(|record| record.into_classifier(n_alleles))
            .collect::<Result<Vec<_>>>()?;
        Model::from_parts(self.markers, self.alleles, classifiers)?
            .with_min_rare_freq(self.min_rare_freq)
    }
}

impl Model {
    /// Write the ensemble as JSON; the training cohort is not part of it.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = ModelRecord::from_model(self)?;
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &record)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Model> {
        let reader = BufReader::new(File::open(path)?);
        let record: ModelRecord = serde_json::from_reader(reader)?;
        record.into_model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        let mut set = HaplotypeSet::new(3, 3).unwrap();
        set.push(0, Haplotype::from_bit_string("010", 0.1 + 0.2).unwrap())
            .unwrap();
        set.push(2, Haplotype::from_bit_string("111", 1.0 / 3.0).unwrap())
            .unwrap();
        set.push(2, Haplotype::from_bit_string("001", 1.0 - 0.3 - 1.0 / 3.0).unwrap())
            .unwrap();
        Classifier::new(vec![4, 0, 2], set, vec![0, 2, 1, 1, 0], 0.75)
    }

    #[test]
    fn classifier_record_roundtrip_is_exact() {
        let original = classifier();
        let record = ClassifierRecord::from_classifier(&original).unwrap();
        assert_eq!(record.haplotypes[1].haplotype, "111");
        assert_eq!(record.haplotypes[1].allele, 2);
        let text = serde_json::to_string(&record).unwrap();
        let parsed: ClassifierRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.into_classifier(3).unwrap(), original);
    }

    #[test]
    fn records_without_floor_use_the_default() {
        let text = r#"{"markers": [{"id": "rs1", "position": null}], "alleles": ["A"], "classifiers": []}"#;
        let record: ModelRecord = serde_json::from_str(text).unwrap();
        assert_eq!(record.min_rare_freq, MIN_RARE_FREQ);
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut record = ClassifierRecord::from_classifier(&classifier()).unwrap();
        record.haplotypes[0].haplotype = "01".to_owned();
        assert!(matches!(
            record.clone().into_classifier(3),
            Err(Error::InvalidValue { .. })
        ));
        record.haplotypes[0].haplotype = "01x".to_owned();
        assert!(record.clone().into_classifier(3).is_err());
        record.haplotypes[0].haplotype = "010".to_owned();
        assert!(matches!(
            record.into_classifier(2),
            Err(Error::InvalidIndex { .. })
        ));
    }

    #[test]
    fn model_record_checks_catalogs() {
        let record = ModelRecord {
            markers: MarkerCatalog::from_ids((0..5).map(|i| format!("rs{}", i))),
            alleles: AlleleCatalog::new(vec!["A".to_owned(), "B".to_owned(), "C".to_owned()]),
            min_rare_freq: 0.01,
            classifiers: vec![ClassifierRecord::from_classifier(&classifier()).unwrap()],
        };
        let model = record.clone().into_model().unwrap();
        assert_eq!(model.n_classifiers(), 1);
        assert!(model.cohort().is_none());
        assert_eq!(model.min_rare_freq(), 0.01);
        assert_eq!(ModelRecord::from_model(&model).unwrap(), record);

        let mut zero_floor = record.clone();
        zero_floor.min_rare_freq = 0.0;
        assert!(matches!(
            zero_floor.into_model(),
            Err(Error::InvalidValue { .. })
        ));

        let mut narrow = record;
        narrow.markers = MarkerCatalog::from_ids((0..3).map(|i| format!("rs{}", i)));
        assert!(narrow.into_model().is_err());
    }
}
