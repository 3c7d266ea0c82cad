use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use walcap_pg::OutputFormat;

#[derive(Parser)]
#[command(name = "walcap")]
#[command(about = "Stream PostgreSQL logical replication changes as typed events")]
#[command(version)]
pub struct Cli {
    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Path to walcap.toml config file
    #[arg(short, long, global = true, default_value = "walcap.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream changes until interrupted
    Run(RunArgs),

    /// Show slot and publication status
    Status {
        /// Replication slot name
        #[arg(long)]
        slot: Option<String>,

        /// Publication name
        #[arg(long)]
        publication: Option<String>,
    },

    /// Drop the replication slot
    Drop {
        /// Replication slot name
        #[arg(long)]
        slot: Option<String>,

        /// Also drop the publication
        #[arg(long)]
        publication: bool,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Replication slot name
    #[arg(long)]
    pub slot: Option<String>,

    /// Publication name (pgoutput only)
    #[arg(long)]
    pub publication: Option<String>,

    /// Logical decoding plugin: pgoutput or wal2json
    #[arg(long)]
    pub output_format: Option<OutputFormat>,

    /// Create a temporary slot that is dropped when the session ends
    #[arg(long)]
    pub temporary: bool,

    /// Start position, e.g. 0/16B3748 (defaults to the slot's confirmed position)
    #[arg(long)]
    pub start_lsn: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "walcap",
            "run",
            "--slot",
            "s1",
            "--output-format",
            "wal2json",
            "--temporary",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.slot.as_deref(), Some("s1"));
                assert_eq!(args.output_format, Some(OutputFormat::Wal2Json));
                assert!(args.temporary);
                assert!(args.publication.is_none());
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("walcap.toml"));
    }

    #[test]
    fn test_unknown_output_format_is_rejected() {
        assert!(Cli::try_parse_from(["walcap", "run", "--output-format", "test_decoding"]).is_err());
    }
}
