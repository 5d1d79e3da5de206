use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "parkflow")]
#[command(about = "Forward parking occupancy changes to durable sinks")]
#[command(version)]
pub struct Cli {
    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Path to the parkflow.toml config file
    #[arg(short, long, global = true, default_value = "parkflow.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an example parkflow.toml and .env.example
    Init {
        /// Directory to initialize
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },

    /// Create the state database and Postgres sink tables
    Setup,

    /// Poll the feed and forward changes until interrupted
    Run,

    /// Ingest snapshot files once, deliver, and exit
    Ingest {
        /// Snapshot files, ingested in the order given
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show batch sequence, sink checkpoints and dead letters
    Status,

    /// Manage the dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead letters, newest first
    List {
        /// Filter by sink name
        #[arg(long)]
        sink: Option<String>,

        /// Maximum number of entries to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show details of a dead letter
    Show {
        /// Entry ID
        id: i64,
    },

    /// Re-deliver dead letters to their sink
    Retry {
        /// Retry a specific entry by ID
        #[arg(long, conflicts_with = "sink")]
        id: Option<i64>,

        /// Retry all entries for a sink
        #[arg(long)]
        sink: Option<String>,
    },

    /// Delete dead letters
    Clear {
        /// Clear entries for a specific sink
        #[arg(long, conflicts_with = "all")]
        sink: Option<String>,

        /// Clear all entries
        #[arg(long)]
        all: bool,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
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
    fn test_parse_ingest_files() {
        let cli = Cli::parse_from(["parkflow", "-c", "other.toml", "ingest", "a.json", "b.json"]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        match cli.command {
            Commands::Ingest { files } => assert_eq!(files.len(), 2),
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn test_ingest_requires_files() {
        assert!(Cli::try_parse_from(["parkflow", "ingest"]).is_err());
    }

    #[test]
    fn test_dlq_clear_flags_conflict() {
        assert!(Cli::try_parse_from(["parkflow", "dlq", "clear", "--sink", "pg", "--all"]).is_err());
        assert!(Cli::try_parse_from(["parkflow", "dlq", "clear", "--all", "--yes"]).is_ok());
    }
}
