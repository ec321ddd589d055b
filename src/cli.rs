use crate::commands;
use crate::config::{Mtry, TrainingParams};
use crate::prediction::VoteMethod;
use anyhow::Result;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "hlabag",
    about = "HLA genotype imputation from SNP panels with attribute bagging.",
    setting = structopt::clap::AppSettings::ColoredHelp,
)]
pub struct Hlabag {
    #[structopt(long, short, help = "Print debug messages of the marker search.")]
    pub verbose: bool,
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt, Clone)]
pub enum Command {
    #[structopt(
        name = "train",
        about = "Train an ensemble of classifiers on a labeled cohort.",
        setting = structopt::clap::AppSettings::ColoredHelp,
    )]
    Train {
        #[structopt(
            long = "genotypes",
            required = true,
            help = "CSV table with a sample column followed by one column of 0/1/2 calls per marker."
        )]
        genotypes: PathBuf,
        #[structopt(
            long = "labels",
            required = true,
            help = "CSV table with sample, allele1 and allele2 columns."
        )]
        labels: PathBuf,
        #[structopt(long = "output", required = true, help = "Trained model (JSON).")]
        output: PathBuf,
        #[structopt(
            long = "config",
            help = "YAML file with training parameters; the options below override it."
        )]
        config: Option<PathBuf>,
        #[structopt(long = "n-classifiers", help = "Number of classifiers (default: 100).")]
        n_classifiers: Option<usize>,
        #[structopt(
            long = "mtry",
            help = "Candidate markers per search round: sqrt, all, one, a count or a fraction (default: sqrt)."
        )]
        mtry: Option<Mtry>,
        #[structopt(long = "no-prune", help = "Keep non-informative markers in the pool.")]
        no_prune: bool,
        #[structopt(
            long = "seed",
            help = "Seed of the random generator (default: drawn from system entropy and logged)."
        )]
        seed: Option<u64>,
        #[structopt(
            long = "threads",
            help = "Build classifiers on this many threads (default: sequential)."
        )]
        threads: Option<usize>,
    },
    #[structopt(
        name = "predict",
        about = "Predict HLA allele pairs with a trained model.",
        setting = structopt::clap::AppSettings::ColoredHelp,
    )]
    Predict {
        #[structopt(long = "model", required = true, help = "Trained model (JSON).")]
        model: PathBuf,
        #[structopt(
            long = "genotypes",
            required = true,
            help = "CSV table of the individuals to type; markers are matched by id."
        )]
        genotypes: PathBuf,
        #[structopt(long = "output", required = true, help = "CSV table of best guesses.")]
        output: PathBuf,
        #[structopt(
            long = "vote-method",
            default_value = "prob",
            help = "Ensemble vote: prob or majority."
        )]
        vote_method: VoteMethod,
        #[structopt(long = "posterior", help = "Also write the full posterior to this CSV table.")]
        posterior: Option<PathBuf>,
        #[structopt(
            long = "threads",
            help = "Score individuals on this many threads (default: all cores)."
        )]
        threads: Option<usize>,
    },
    #[structopt(
        name = "merge",
        about = "Merge models trained on the same catalogs.",
        setting = structopt::clap::AppSettings::ColoredHelp,
    )]
    Merge {
        #[structopt(long = "inputs", required = true, min_values = 1, help = "Models to merge.")]
        inputs: Vec<PathBuf>,
        #[structopt(long = "output", required = true, help = "Merged model (JSON).")]
        output: PathBuf,
    },
}

pub fn run(opt: Hlabag) -> Result<()> {
    match opt.command {
        Command::Train {
            genotypes,
            labels,
            output,
            config,
            n_classifiers,
            mtry,
            no_prune,
            seed,
            threads,
        } => {
            let mut params = match config {
                Some(path) => TrainingParams::from_yaml(path)?,
                None => TrainingParams::default(),
            };
            if let Some(n) = n_classifiers {
                params.n_classifiers = n;
            }
            if let Some(mtry) = mtry {
                params.mtry = mtry;
            }
            if no_prune {
                params.prune = false;
            }
            if seed.is_some() {
                params.seed = seed;
            }
            if threads.is_some() {
                params.threads = threads;
            }
            commands::train::CallerBuilder::default()
                .genotypes(genotypes)
                .labels(labels)
                .output(output)
                .params(params)
                .build()?
                .call()
        }
        Command::Predict {
            model,
            genotypes,
            output,
            vote_method,
            posterior,
            threads,
        } => commands::predict::CallerBuilder::default()
            .model(model)
            .genotypes(genotypes)
            .output(output)
            .vote(vote_method)
            .posterior(posterior)
            .threads(threads)
            .build()?
            .call(),
        Command::Merge { inputs, output } => commands::merge::CallerBuilder::default()
            .inputs(inputs)
            .output(output)
            .build()?
            .call(),
    }
}
