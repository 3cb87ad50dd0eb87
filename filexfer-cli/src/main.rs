//! filexfer CLI
//!
//! Drives the transfer engine from the command line: loopback copies through
//! the in-memory transport, and inspection helpers for resume state and
//! configuration.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use filexfer::logging::{init_logging, LoggingConfig};

use commands::bitmask::BitmaskAction;
use commands::copy::CopyArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "filexfer", version, about = "Resumable chunked file transfers")]
struct Cli {
    /// Configuration file (INI)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log engine activity at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a file through the loopback transport and download it back
    Copy(CopyArgs),
    /// Encode or decode ready-part bitmasks
    Bitmask {
        #[command(subcommand)]
        action: BitmaskAction,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::default()
        .with_default_filter(if cli.verbose { "filexfer=debug" } else { "warn" });
    if let Some(path) = &cli.log_file {
        logging = logging.with_log_file(path);
    }
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Copy(args) => commands::copy::run(config, args).await,
        Commands::Bitmask { action } => commands::bitmask::run(action),
        Commands::Config => {
            commands::config::run(&config);
            Ok(())
        }
    }
}
