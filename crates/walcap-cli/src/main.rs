use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod env;

use cli::{Cli, Commands};
use config::ProjectConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("walcap=info,walcap_pg=info,walcap_core=info")),
        )
        .init();

    let cli = Cli::parse();

    env::load_dotenv_from_ancestors(cli.env.as_deref())?;
    let config = ProjectConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run(args) => commands::cmd_run(config, args).await,
        Commands::Status { slot, publication } => {
            commands::cmd_status(config, slot, publication).await
        }
        Commands::Drop { slot, publication } => commands::cmd_drop(config, slot, publication).await,
    }
}
