use crate::errors::{Error, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Maximum number of markers one classifier panel can hold.
#[cfg(not(feature = "wide-panel"))]
pub const MAX_MARKERS: usize = 128;
#[cfg(feature = "wide-panel")]
pub const MAX_MARKERS: usize = 256;

pub(crate) const WORD_BITS: usize = 64;
pub(crate) const N_WORDS: usize = MAX_MARKERS / WORD_BITS;

/// Relative deviance gain a tied round has to achieve for its marker to be added.
pub const STOP_RELTOL_ADD_MARKER: f64 = 0.001;
/// Relative deviance slack that spares a tied candidate from eviction when pruning.
pub const PRUNE_RELTOL: f64 = 0.1;
/// Absolute frequency floor of a haplotype, also the per-mismatch discount at prediction.
pub const MIN_RARE_FREQ: f64 = 1e-5;

#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct EmParams {
    pub max_iterations: usize,
    pub rel_tol: f64,
    /// added to every seeded frequency after a haplotype set is doubled
    pub init_offset: f64,
    pub min_rare_freq: f64,
    pub rare_fraction: f64,
}

impl Default for EmParams {
    fn default() -> Self {
        EmParams {
            max_iterations: 500,
            rel_tol: f64::EPSILON.sqrt(),
            init_offset: 0.001,
            min_rare_freq: MIN_RARE_FREQ,
            rare_fraction: 0.1,
        }
    }
}

impl EmParams {
    /// Frequency below which one half of a doubled haplotype gets merged into the other.
    pub fn rare_threshold(&self, n_samples: usize) -> f64 {
        let scaled = if n_samples > 0 {
            self.rare_fraction / (2 * n_samples) as f64
        } else {
            0.0
        };
        scaled.max(self.min_rare_freq)
    }
}

/// Number of candidate markers drawn per selection round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mtry {
    Sqrt,
    All,
    One,
    Count(usize),
    Fraction(f64),
}

impl Mtry {
    pub fn resolve(&self, n_total: usize) -> usize {
        let n = match *self {
            Mtry::Sqrt => (n_total as f64).sqrt().floor() as usize,
            Mtry::All => n_total,
            Mtry::One => 1,
            Mtry::Count(k) => k,
            Mtry::Fraction(f) => (n_total as f64 * f).ceil() as usize,
        };
        n.max(1).min(n_total.max(1))
    }
}

impl FromStr for Mtry {
    type Err = Error;

    fn from_str(input: &str) -> Result<Mtry> {
        match input {
            "sqrt" => Ok(Mtry::Sqrt),
            "all" => Ok(Mtry::All),
            "one" => Ok(Mtry::One),
            _ => {
                if let Ok(k) = input.parse::<usize>() {
                    if k > 0 {
                        return Ok(Mtry::Count(k));
                    }
                } else if let Ok(f) = input.parse::<f64>() {
                    if f > 0.0 && f < 1.0 {
                        return Ok(Mtry::Fraction(f));
                    }
                }
                Err(Error::InvalidMtry(input.to_owned()))
            }
        }
    }
}

impl TryFrom<String> for Mtry {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Mtry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mtry::Sqrt => write!(f, "sqrt"),
            Mtry::All => write!(f, "all"),
            Mtry::One => write!(f, "one"),
            Mtry::Count(k) => write!(f, "{}", k),
            Mtry::Fraction(x) => write!(f, "{}", x),
        }
    }
}

impl From<Mtry> for String {
    fn from(mtry: Mtry) -> String {
        mtry.to_string()
    }
}

#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct TrainingParams {
    pub n_classifiers: usize,
    pub mtry: Mtry,
    pub prune: bool,
    /// None draws a fresh seed from system entropy for every build
    #[builder(setter(strip_option))]
    pub seed: Option<u64>,
    /// None builds classifiers one after another on the calling thread
    pub threads: Option<usize>,
    pub em: EmParams,
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            n_classifiers: 100,
            mtry: Mtry::Sqrt,
            prune: true,
            seed: None,
            threads: None,
            em: EmParams::default(),
        }
    }
}

impl TrainingParams {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn mtry_parses_policies() {
        assert_eq!("sqrt".parse::<Mtry>().unwrap(), Mtry::Sqrt);
        assert_eq!("all".parse::<Mtry>().unwrap(), Mtry::All);
        assert_eq!("one".parse::<Mtry>().unwrap(), Mtry::One);
        assert_eq!("7".parse::<Mtry>().unwrap(), Mtry::Count(7));
        assert_eq!("0.25".parse::<Mtry>().unwrap(), Mtry::Fraction(0.25));
        assert!("0".parse::<Mtry>().is_err());
        assert!("1.5".parse::<Mtry>().is_err());
        assert!("many".parse::<Mtry>().is_err());
    }

    #[test]
    fn mtry_resolves_against_pool_size() {
        assert_eq!(Mtry::Sqrt.resolve(100), 10);
        assert_eq!(Mtry::Sqrt.resolve(3), 1);
        assert_eq!(Mtry::All.resolve(42), 42);
        assert_eq!(Mtry::One.resolve(42), 1);
        assert_eq!(Mtry::Count(50).resolve(10), 10);
        assert_eq!(Mtry::Fraction(0.25).resolve(10), 3);
    }

    #[test]
    fn rare_threshold_has_floor() {
        let em = EmParams::default();
        assert_approx_eq!(em.rare_threshold(5), 0.01);
        assert_approx_eq!(em.rare_threshold(1_000_000), 1e-5);
    }

    #[test]
    fn params_from_yaml_override_defaults() {
        let params: TrainingParams =
            serde_yaml::from_str("n_classifiers: 5\nmtry: all\nem:\n  max_iterations: 20\n")
                .unwrap();
        assert_eq!(params.n_classifiers, 5);
        assert_eq!(params.mtry, Mtry::All);
        assert!(params.prune);
        assert_eq!(params.seed, None);
        assert_eq!(params.em.max_iterations, 20);
        assert_eq!(params.em.min_rare_freq, 1e-5);
    }

    #[test]
    fn builder_fills_defaults() {
        let params = TrainingParamsBuilder::default()
            .n_classifiers(3)
            .seed(7)
            .build()
            .unwrap();
        assert_eq!(params.n_classifiers, 3);
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.mtry, Mtry::Sqrt);
    }
}
