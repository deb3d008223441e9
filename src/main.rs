//! Pending variants bookkeeping main executable

pub mod common;
pub mod err;
pub mod fs;
pub mod pending;
pub mod primary;
pub mod variant;

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Pending variants bookkeeping",
    long_about = "This tool tracks variants that still require deferred annotation"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Import variant records into the primary store.
    Import(primary::import::Args),
    /// Discover pending variants in the primary store.
    Discover(pending::cli::DiscoverArgs),
    /// Write pending variants as JSON lines.
    List(pending::cli::ListArgs),
    /// Read the whole pending store once.
    Check(pending::cli::CheckArgs),
    /// Remove the pending store.
    Delete(pending::cli::DeleteArgs),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(common::tracing_level(&cli.common.verbose))
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Import(args) => primary::import::run(&cli.common, args)?,
            Commands::Discover(args) => pending::cli::run_discover(&cli.common, args)?,
            Commands::List(args) => pending::cli::run_list(&cli.common, args)?,
            Commands::Check(args) => pending::cli::run_check(&cli.common, args)?,
            Commands::Delete(args) => pending::cli::run_delete(&cli.common, args)?,
        }

        Ok::<(), anyhow::Error>(())
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
