//! CSV tables read and written by the command line.
//!
//! Genotypes: header `sample,<marker ids...>`, one row per individual with calls `0`, `1`
//! or `2`; an empty field, `NA` or `?` is a missing call.
//! Labels: `sample,allele1,allele2` with opaque allele names.

use csv::ReaderBuilder;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::{Error, Result};
use crate::hla::{pairs, AlleleCatalog, HlaPair, MarkerCatalog};
use crate::model::{Cohort, Predictions};

#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeTable {
    pub samples: Vec<String>,
    pub markers: MarkerCatalog,
    /// individuals × markers
    pub calls: Array2<Option<u8>>,
}

fn parse_call(field: &str) -> Option<Option<u8>> {
    match field.trim() {
        "" | "NA" | "?" => Some(None),
        "0" => Some(Some(0)),
        "1" => Some(Some(1)),
        "2" => Some(Some(2)),
        _ => None,
    }
}

pub fn read_genotypes<P: AsRef<Path>>(path: P) -> Result<GenotypeTable> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let header = reader.headers()?.clone();
    if header.len() < 2 {
        return Err(Error::malformed(path, "expected a sample column followed by marker columns"));
    }
    let markers = MarkerCatalog::from_ids(header.iter().skip(1).map(|id| id.trim().to_owned()));
    if markers.iter().map(|m| m.id.as_str()).unique().count() != markers.len() {
        return Err(Error::malformed(path, "duplicated marker id in header"));
    }

    let mut samples = Vec::new();
    let mut flat = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        samples.push(record[0].trim().to_owned());
        for field in record.iter().skip(1) {
            let call = parse_call(field).ok_or_else(|| {
                Error::malformed(
                    path,
                    format!("row {}: '{}' is not a genotype call", row + 1, field),
                )
            })?;
            flat.push(call);
        }
    }
    let calls = Array2::from_shape_vec((samples.len(), markers.len()), flat)
        .map_err(|err| Error::malformed(path, err.to_string()))?;
    Ok(GenotypeTable {
        samples,
        markers,
        calls,
    })
}

impl GenotypeTable {
    /// Calls reordered to `markers`; catalog markers absent from the table are missing.
    pub fn aligned_to(&self, markers: &MarkerCatalog) -> Array2<Option<u8>> {
        let columns: HashMap<&str, usize> = self
            .markers
            .iter()
            .enumerate()
            .map(|(idx, marker)| (marker.id.as_str(), idx))
            .collect();
        let lookup: Vec<Option<usize>> = markers
            .iter()
            .map(|marker| columns.get(marker.id.as_str()).copied())
            .collect();
        Array2::from_shape_fn((self.samples.len(), markers.len()), |(i, j)| {
            lookup[j].and_then(|col| self.calls[[i, col]])
        })
    }
}

/// `(sample, allele1, allele2)` rows of a label table.
pub fn read_labels<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String, String)>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().from_path(path)?;
    let mut labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != 3 {
            return Err(Error::malformed(
                path,
                format!("row {}: expected sample, allele1 and allele2", row + 1),
            ));
        }
        labels.push((
            record[0].trim().to_owned(),
            record[1].trim().to_owned(),
            record[2].trim().to_owned(),
        ));
    }
    Ok(labels)
}

/// Join genotypes with labels by sample name. The allele catalog is the sorted set of
/// allele names seen in the labels; unlabeled samples are left out.
pub fn labeled_cohort<P: AsRef<Path>>(
    genotypes: &GenotypeTable,
    labels: P,
) -> Result<(AlleleCatalog, Cohort)> {
    let path = labels.as_ref();
    let labels = read_labels(path)?;
    let alleles = AlleleCatalog::new(
        labels
            .iter()
            .flat_map(|(_, a1, a2)| vec![a1.clone(), a2.clone()])
            .sorted()
            .dedup()
            .collect(),
    );
    let by_sample: HashMap<&str, (&str, &str)> = labels
        .iter()
        .map(|(sample, a1, a2)| (sample.as_str(), (a1.as_str(), a2.as_str())))
        .collect();

    let mut rows = Vec::new();
    let mut cohort_labels = Vec::new();
    for (idx, sample) in genotypes.samples.iter().enumerate() {
        if let Some((a1, a2)) = by_sample.get(sample.as_str()) {
            let id = |name: &str| {
                alleles
                    .id(name)
                    .ok_or_else(|| Error::malformed(path, format!("unknown allele {}", name)))
            };
            cohort_labels.push(HlaPair::new(id(*a1)?, id(*a2)?));
            rows.push(idx);
        }
    }
    if rows.is_empty() {
        return Err(Error::malformed(path, "no labeled sample found in the genotype table"));
    }
    let calls = genotypes.calls.select(ndarray::Axis(0), &rows);
    let cohort = Cohort::new(calls, cohort_labels, alleles.len())?;
    Ok((alleles, cohort))
}

pub fn write_predictions<P: AsRef<Path>>(
    path: P,
    samples: &[String],
    alleles: &AlleleCatalog,
    predictions: &Predictions,
) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(&["sample", "allele1", "allele2", "prob"])?;
    for ((sample, call), prob) in samples
        .iter()
        .zip(&predictions.calls)
        .zip(&predictions.probs)
    {
        match call {
            Some(pair) => {
                let prob = format!("{:.4}", prob);
                wtr.write_record(&[
                    sample.as_str(),
                    alleles.name(pair.allele1)?,
                    alleles.name(pair.allele2)?,
                    prob.as_str(),
                ])?
            }
            None => wtr.write_record(&[sample.as_str(), "", "", ""])?,
        }
    }
    wtr.flush()?;
    Ok(())
}

/// One row per individual, one column per allele pair in (h1, h2) enumeration order.
pub fn write_posterior<P: AsRef<Path>>(
    path: P,
    samples: &[String],
    alleles: &AlleleCatalog,
    posterior: ArrayView2<f64>,
) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec!["sample".to_owned()];
    for pair in pairs(alleles.len()) {
        header.push(alleles.pair_name(&pair)?);
    }
    wtr.write_record(&header)?;
    for (sample, row) in samples.iter().zip(posterior.outer_iter()) {
        let mut record = vec![sample.clone()];
        record.extend(row.iter().map(|p| format!("{:.6}", p)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
