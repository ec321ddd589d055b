use anyhow::Result;
use hlabag::cli::{run, Hlabag};
use structopt::StructOpt;

pub(crate) fn main() -> Result<()> {
    let opt = Hlabag::from_args();

    // setup logger
    let level = if opt.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;

    run(opt)?;

    Ok(())
}
