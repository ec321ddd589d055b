use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid index {index} (bound {bound}): {context}")]
    InvalidIndex {
        index: usize,
        bound: usize,
        context: &'static str,
    },
    #[error("invalid value {value}: {context}")]
    InvalidValue { value: String, context: &'static str },
    #[error("invalid vote method '{0}', expected 'prob' or 'majority'")]
    InvalidVoteMethod(String),
    #[error("invalid mtry '{0}', expected 'sqrt', 'all', 'one', a count or a fraction in (0, 1)")]
    InvalidMtry(String),
    #[error("no usable markers for {n_individuals} individual(s)")]
    NoUsableMarkers { n_individuals: usize },
    #[error("cannot merge models: {0}")]
    ModelMismatch(String),
    #[error("a cohort of {n} individual(s) leaves no out-of-bag individual, at least 2 are required")]
    InsufficientCohort { n: usize },
    #[error("model carries no training cohort")]
    MissingCohort,
    #[error("malformed input {path:?}: {message}")]
    MalformedInput { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_index(index: usize, bound: usize, context: &'static str) -> Self {
        Error::InvalidIndex {
            index,
            bound,
            context,
        }
    }

    pub(crate) fn invalid_value<T: ToString>(value: T, context: &'static str) -> Self {
        Error::InvalidValue {
            value: value.to_string(),
            context,
        }
    }

    pub(crate) fn malformed<P: Into<PathBuf>, M: Into<String>>(path: P, message: M) -> Self {
        Error::MalformedInput {
            path: path.into(),
            message: message.into(),
        }
    }
}
