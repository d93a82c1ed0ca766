//! tracklib command-line interface.
//!
//! Manages the default library: its root paths, synchronization and track
//! listing, plus replay of serialized queries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracklib::config::TracklibConfig;
use tracklib::library::LibraryRegistry;
use tracklib::router::MessageRouter;
use tracklib_logging::{init_logging, LogConfig};

mod cli;

#[derive(Parser, Debug)]
#[command(name = "tracklib", version, about = "Local media library indexer")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $TRACKLIB_HOME/config.toml)
    #[arg(long, global = true, env = "TRACKLIB_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List library root paths
    Paths,

    /// Add a root directory and synchronize
    AddPath {
        /// Directory to index
        path: PathBuf,
    },

    /// Remove a root directory and its tracks
    RemovePath {
        /// Directory previously added
        path: PathBuf,
    },

    /// Reconcile the library with the filesystem
    Sync {
        /// Cancel a run in progress and start over
        #[arg(long)]
        restart: bool,
    },

    /// List tracks
    Tracks {
        /// Substring of the title or file name
        #[arg(short, long)]
        filter: Option<String>,

        /// Maximum tracks to display
        #[arg(long, default_value = "50")]
        limit: u32,

        /// Tracks to skip
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Replay a serialized query request
    ///
    /// Example:
    ///   tracklib query '{"kind":"track_count","params":{}}'
    Query {
        /// JSON request: {"kind": ..., "options": ..., "params": {...}}
        request: String,
    },

    /// Print the resolved configuration
    Config,
}

fn run_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(TracklibConfig::default_path);
    let config = TracklibConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Commands::Config = cli.command {
        println!("# {}", config_path.display());
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let router = MessageRouter::new();
    let mut registry = LibraryRegistry::new(config, router);
    let library = registry
        .default_library()
        .context("Failed to open the default library")?;
    info!(library = %library.id(), "Running command");

    let json = cli.json;
    let result = match cli.command {
        Commands::Paths => cli::paths::list(&library, json),
        Commands::AddPath { path } => cli::paths::add(&library, cli::paths::PathArgs { path, json }),
        Commands::RemovePath { path } => {
            cli::paths::remove(&library, cli::paths::PathArgs { path, json })
        }
        Commands::Sync { restart } => cli::sync::run(&library, cli::sync::SyncArgs { restart, json }),
        Commands::Tracks {
            filter,
            limit,
            offset,
        } => cli::tracks::run(
            &library,
            cli::tracks::TracksArgs {
                filter,
                limit,
                offset,
                json,
            },
        ),
        Commands::Query { request } => cli::query::run(&library, &request),
        Commands::Config => Ok(()),
    };

    drop(library);
    registry.close_all().context("Failed to close library")?;
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "tracklib",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {:?}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}
