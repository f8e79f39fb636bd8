pub mod args;

use clap::{CommandFactory, Parser};
pub use args::{Arguments, SelectionPolicy};

/// Parses the command line.
///
/// Missing required flags or reads print the usage text and exit with status 0,
/// the long-standing behaviour of the pipeline wrapper. Malformed values are
/// reported by clap with its usual status.
pub fn parse() -> Arguments {
    let args = Arguments::parse();
    let missing = args.missing_required();
    if !missing.is_empty() {
        eprintln!("Missing required arguments: {}\n", missing.join(", "));
        let _ = Arguments::command().print_help();
        std::process::exit(0);
    }
    args
}
