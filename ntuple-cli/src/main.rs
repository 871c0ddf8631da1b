mod merge;
mod size;
mod tree;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::merge::{MergeArgs, exec_merge};
use crate::tree::exec_tree;

#[derive(clap::Parser)]
#[command(version, about = "Merge and inspect ntuple containers")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Log more; repeat for more detail. `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Append the datasets of every input to the output, in input order.
    Merge(MergeArgs),
    /// Print the groups and datasets of a container.
    Tree { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logger(default_env_filter(cli.verbose));

    let result = match cli.command {
        Commands::Merge(args) => exec_merge(args),
        Commands::Tree { file } => exec_tree(file).map(|()| true),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("ntcat: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logger(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(false)
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn default_env_filter(verbosity: u8) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_e) => {
            let default_level = match verbosity {
                0 => LevelFilter::WARN,
                1 => LevelFilter::INFO,
                2 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            };

            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["ntcat", "tree", "-vv", "f.ntpl"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Tree { .. }));
    }
}
