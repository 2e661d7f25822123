//! CLI argument parsing with clap

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

pub use crate::commands::delete::DeleteArgs;
pub use crate::commands::info::InfoArgs;
pub use crate::commands::migrate::MigrateArgs;
pub use crate::commands::verify::VerifyArgs;

/// Ferry - move object storage to a file store, verify it, then delete the source
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to ferry.yaml config file
    #[arg(short, long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Directory whose subdirectories are the source units
    #[arg(long, global = true, env = "FERRY_SOURCE_DIR")]
    pub source_dir: Option<Utf8PathBuf>,

    /// Directory backing the remote store
    #[arg(long, global = true, env = "FERRY_REMOTE_DIR")]
    pub remote_dir: Option<Utf8PathBuf>,

    /// Scratch space for downloads and archive parts
    #[arg(long, global = true)]
    pub scratch_dir: Option<Utf8PathBuf>,

    /// Attempt cap for every remote operation
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show configuration and migration progress
    Info(InfoArgs),

    /// Migrate units to the remote store
    Migrate(MigrateArgs),

    /// Verify a sample of migrated units
    Verify(VerifyArgs),

    /// Delete verified units from the source (dry run unless --execute)
    Delete(DeleteArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_migrate_filters() {
        let cli = Cli::try_parse_from([
            "ferry",
            "--source-dir",
            "/data/src",
            "migrate",
            "--units",
            "a,b",
            "--reset",
            "--threshold",
            "1048576",
        ])
        .unwrap();

        assert_eq!(cli.global.source_dir.as_deref().map(|p| p.as_str()), Some("/data/src"));
        match cli.command {
            Commands::Migrate(args) => {
                assert_eq!(args.units, vec!["a".to_string(), "b".to_string()]);
                assert!(args.reset);
                assert_eq!(args.threshold, Some(1_048_576));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_delete_defaults_to_dry_run() {
        let cli = Cli::try_parse_from(["ferry", "delete"]).unwrap();
        match cli.command {
            Commands::Delete(args) => assert!(!args.execute),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_verify_sample_overrides() {
        let cli = Cli::try_parse_from(["ferry", "-v", "verify", "--unit-count", "3", "--file-count", "7"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.unit_count, Some(3));
                assert_eq!(args.file_count, Some(7));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
