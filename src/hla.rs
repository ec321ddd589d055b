use derefable::Derefable;
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Error, Result};

/// An unordered pair of HLA allele ids, stored with `allele1 <= allele2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlaPair {
    pub allele1: usize,
    pub allele2: usize,
}

impl HlaPair {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            HlaPair {
                allele1: a,
                allele2: b,
            }
        } else {
            HlaPair {
                allele1: b,
                allele2: a,
            }
        }
    }

    pub fn is_homozygous(&self) -> bool {
        self.allele1 == self.allele2
    }

    /// Number of alleles (0, 1 or 2) shared with `truth`, counting each allele of
    /// `truth` at most once.
    pub fn matching_alleles(&self, truth: &HlaPair) -> usize {
        let (mut t1, mut t2) = (Some(truth.allele1), Some(truth.allele2));
        let mut count = 0;
        for allele in [self.allele1, self.allele2].iter() {
            if t1 == Some(*allele) {
                t1 = None;
                count += 1;
            } else if t2 == Some(*allele) {
                t2 = None;
                count += 1;
            }
        }
        count
    }

    /// Position of the pair in the (h1, h2), h1 <= h2 enumeration over `n_alleles`.
    pub fn pair_index(&self, n_alleles: usize) -> usize {
        pair_index(self.allele1, self.allele2, n_alleles)
    }
}

impl fmt::Display for HlaPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.allele1, self.allele2)
    }
}

#[inline]
pub fn pair_index(h1: usize, h2: usize, n_alleles: usize) -> usize {
    let (h1, h2) = if h1 <= h2 { (h1, h2) } else { (h2, h1) };
    h2 + h1 * (2 * n_alleles - h1 - 1) / 2
}

#[inline]
pub fn n_pairs(n_alleles: usize) -> usize {
    n_alleles * (n_alleles + 1) / 2
}

/// All pairs in enumeration order.
pub fn pairs(n_alleles: usize) -> impl Iterator<Item = HlaPair> {
    (0..n_alleles).flat_map(move |h1| (h1..n_alleles).map(move |h2| HlaPair::new(h1, h2)))
}

/// Allele names, the dense ids used everywhere else are positions in this list.
#[derive(Derefable, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlleleCatalog(#[deref] Vec<String>);

impl AlleleCatalog {
    pub fn new(names: Vec<String>) -> Self {
        AlleleCatalog(names)
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.iter().position(|allele| allele == name)
    }

    pub fn name(&self, id: usize) -> Result<&str> {
        self.get(id)
            .map(String::as_str)
            .ok_or_else(|| Error::invalid_index(id, self.len(), "AlleleCatalog::name"))
    }

    pub fn pair_name(&self, pair: &HlaPair) -> Result<String> {
        Ok(format!("{}/{}", self.name(pair.allele1)?, self.name(pair.allele2)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct Marker {
    pub id: String,
    pub position: Option<u64>,
}

#[derive(Derefable, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarkerCatalog(#[deref] Vec<Marker>);

impl MarkerCatalog {
    pub fn new(markers: Vec<Marker>) -> Self {
        MarkerCatalog(markers)
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        MarkerCatalog(ids.into_iter().map(|id| Marker::new(id, None)).collect())
    }
}
