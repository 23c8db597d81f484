//! migpart CLI
//!
//! Plans, persists and enforces GPU-slice / CPU partitions on one host.

mod commands;

use clap::{Parser, Subcommand};
use migpart_core::{MigpartConfig, PartitionError};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// migpart - MIG slice and CPU/NUMA partition allocator
#[derive(Parser, Debug)]
#[command(name = "migpart")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to /etc/migpart/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan partitions over the host and persist them
    Setup {
        /// Desired number of partitions
        count: u32,

        /// Print the plan without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a command inside a partition
    Launch {
        /// Partition index
        index: u32,

        /// Run the command as this user (requires root)
        #[arg(long)]
        user: Option<String>,

        /// Return once the command is running
        #[arg(long)]
        detach: bool,

        /// Command to run
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List persisted partitions
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the discovered host topology
    Topology {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a running process against its partition
    Check {
        /// Partition index
        index: u32,

        /// Process id
        pid: u32,
    },

    /// Print a systemd slice unit for a partition
    SliceUnit {
        /// Partition index
        index: u32,
    },

    /// Remove every partition group
    Teardown,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<PartitionError>()
                .map(PartitionError::exit_code)
                .unwrap_or(125)
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = MigpartConfig::load(cli.config.as_deref())?;

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(Level::WARN)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Setup { count, dry_run } => commands::setup(&config, count, dry_run).await,
        Commands::Launch {
            index,
            user,
            detach,
            command,
            args,
        } => commands::launch(&config, index, user, detach, command, args).await,
        Commands::List { json } => commands::list(&config, json).await,
        Commands::Topology { json } => commands::topology(&config, json).await,
        Commands::Check { index, pid } => commands::check(&config, index, pid).await,
        Commands::SliceUnit { index } => commands::slice_unit(&config, index).await,
        Commands::Teardown => commands::teardown(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_launch_passes_command_flags_through() {
        let cli = Cli::parse_from([
            "migpart", "launch", "2", "--user", "alice", "python", "train.py", "--epochs", "3",
        ]);
        match cli.command {
            Commands::Launch {
                index,
                user,
                detach,
                command,
                args,
            } => {
                assert_eq!(index, 2);
                assert_eq!(user.as_deref(), Some("alice"));
                assert!(!detach);
                assert_eq!(command, "python");
                assert_eq!(args, vec!["train.py", "--epochs", "3"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_setup_dry_run() {
        let cli = Cli::parse_from(["migpart", "--verbose", "setup", "7", "--dry-run"]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Setup {
                count: 7,
                dry_run: true
            }
        ));
    }
}
