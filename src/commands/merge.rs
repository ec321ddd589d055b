use anyhow::{bail, Result};
use derive_builder::Builder;
use log::info;
use std::path::PathBuf;

use crate::model::Model;

#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct Caller {
    inputs: Vec<PathBuf>,
    output: PathBuf,
}

impl Caller {
    pub fn call(&self) -> Result<()> {
        let mut inputs = self.inputs.iter();
        let mut merged = match inputs.next() {
            Some(path) => Model::load_json(path)?,
            None => bail!("nothing to merge, at least one model is required"),
        };
        let mut duplicates = 0;
        for path in inputs {
            duplicates += merged.merge(Model::load_json(path)?)?;
        }
        if duplicates > 0 {
            bail!(
                "{} classifier(s) occur in more than one input, train each model with its own seed",
                duplicates
            );
        }
        info!(
            "merged {} model(s) into {}",
            self.inputs.len(),
            merged.summary()
        );
        merged.save_json(&self.output)?;
        Ok(())
    }
}
