use anyhow::Result;
use derive_builder::Builder;
use log::info;
use std::path::PathBuf;

use crate::io::{read_genotypes, write_posterior, write_predictions};
use crate::model::Model;
use crate::prediction::VoteMethod;

#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct Caller {
    model: PathBuf,
    genotypes: PathBuf,
    output: PathBuf,
    #[builder(default)]
    vote: VoteMethod,
    #[builder(default)]
    posterior: Option<PathBuf>,
    #[builder(default)]
    threads: Option<usize>,
}

impl Caller {
    pub fn call(&self) -> Result<()> {
        let model = Model::load_json(&self.model)?;
        let table = read_genotypes(&self.genotypes)?;
        let calls = table.aligned_to(model.markers());

        let with_posterior = self.posterior.is_some();
        let predictions = match self.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?
                .install(|| model.predict(calls.view(), self.vote, with_posterior))?,
            None => model.predict(calls.view(), self.vote, with_posterior)?,
        };
        info!(
            "called {} of {} individual(s) with {} classifier(s), {} vote",
            predictions.calls.iter().filter(|call| call.is_some()).count(),
            table.samples.len(),
            model.n_classifiers(),
            self.vote
        );
        write_predictions(&self.output, &table.samples, model.alleles(), &predictions)?;

        if let (Some(path), Some(posterior)) = (&self.posterior, &predictions.posterior) {
            write_posterior(path, &table.samples, model.alleles(), posterior.view())?;
        }
        Ok(())
    }
}
