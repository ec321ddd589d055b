use anyhow::Result;
use derive_builder::Builder;
use log::info;
use std::path::PathBuf;

use crate::config::TrainingParams;
use crate::io::{labeled_cohort, read_genotypes};
use crate::model::Model;
use crate::prediction::VoteMethod;

#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct Caller {
    genotypes: PathBuf,
    labels: PathBuf,
    output: PathBuf,
    #[builder(default)]
    params: TrainingParams,
}

impl Caller {
    pub fn call(&self) -> Result<()> {
        let table = read_genotypes(&self.genotypes)?;
        let (alleles, cohort) = labeled_cohort(&table, &self.labels)?;
        info!(
            "training on {} individual(s), {} marker(s), {} allele(s)",
            cohort.len(),
            table.markers.len(),
            alleles.len()
        );

        let mut model = Model::new(table.markers, alleles, cohort)?;
        model.build_classifiers(&self.params)?;
        info!("{}", model.summary());
        if let Some(cohort) = model.cohort() {
            let accuracy = model.evaluate(cohort, VoteMethod::Prob)?;
            info!("training set accuracy {:.2}%", accuracy * 100.0);
        }

        model.save_json(&self.output)?;
        Ok(())
    }
}
