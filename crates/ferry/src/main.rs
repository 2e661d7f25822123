//! Ferry CLI - resumable bulk object-storage migration
//!
//! This is the main entry point for the Ferry command-line interface.

mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let success = match cli.command {
        Commands::Info(args) => commands::info::run(args, &cli.global).await?,
        Commands::Migrate(args) => commands::migrate::run(args, &cli.global, cli.quiet).await?,
        Commands::Verify(args) => commands::verify::run(args, &cli.global).await?,
        Commands::Delete(args) => commands::delete::run(args, &cli.global).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize tracing with appropriate verbosity
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
