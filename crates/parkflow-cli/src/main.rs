use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;
mod config;
mod dlq;
mod env;

use cli::{Cli, Commands, DlqCommands};
use config::{load_config, open_store};
use env::{env_file_name, load_dotenv_from_ancestors};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env (or .env.{ENV}) before the log filter reads RUST_LOG
    let env_file = env_file_name(cli.env.as_deref());
    let loaded = load_dotenv_from_ancestors(&env_file);

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parkflow=info".parse()?),
        )
        .init();

    // A named environment must exist; the default .env is optional.
    match loaded {
        Ok(path) => debug!(path = %path.display(), "Loaded environment"),
        Err(e) if cli.env.is_some() => return Err(e),
        Err(_) => debug!("No {} file found, using process environment", env_file),
    }

    match cli.command {
        Commands::Init { path } => commands::cmd_init(&path),
        Commands::Setup => commands::cmd_setup(load_config(&cli.config)?).await,
        Commands::Run => commands::cmd_run(load_config(&cli.config)?).await,
        Commands::Ingest { files } => commands::cmd_ingest(load_config(&cli.config)?, files).await,
        Commands::Status => commands::cmd_status(load_config(&cli.config)?).await,
        Commands::Dlq { command } => {
            let config = load_config(&cli.config)?;
            let store = open_store(&config)?;
            match command {
                DlqCommands::List { sink, limit } => dlq::cmd_dlq_list(&store, sink.as_deref(), limit),
                DlqCommands::Show { id } => dlq::cmd_dlq_show(&store, id),
                DlqCommands::Retry { id, sink } => {
                    dlq::cmd_dlq_retry(&config, &store, id, sink.as_deref()).await
                }
                DlqCommands::Clear { sink, all, yes } => {
                    dlq::cmd_dlq_clear(&store, sink.as_deref(), all, yes)
                }
            }
        }
    }
}
