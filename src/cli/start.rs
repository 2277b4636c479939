use crate::{Result, cli::actions::Action, cli::commands, cli::dispatch};
use std::env;

/// Parse the command line, initialize logging, and return the action to
/// run.
///
/// # Errors
/// `BadInput`/`InvalidToken` for a command line that cannot be acted on
pub fn start() -> Result<Action> {
    let args = commands::expand_extra_args(env::args());
    let matches = commands::new().get_matches_from(args);

    let verbosity_level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(verbosity_level)
        .init();

    dispatch::dispatch(&matches)
}
