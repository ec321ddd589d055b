pub mod cli;
pub mod commands;
pub mod config;
pub mod em;
pub mod errors;
pub mod hla;
pub mod io;
pub mod model;
pub mod prediction;
pub mod selection;
pub mod serialization;
pub mod store;

pub use errors::{Error, Result};
