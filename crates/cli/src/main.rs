//! Blobs CLI - blobs command

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;

mod cmd;
mod config;

/// Blobs - content-addressed blob store administration
#[derive(Parser)]
#[command(name = "blobs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/blobs/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory, overriding the config file
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file (or stdin) and print its reference
    Put {
        /// File to store; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Write a blob to stdout or a file
    Get {
        /// Blob reference
        reference: String,
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a blob
    Rm {
        /// Blob reference
        reference: String,
    },
    /// Print the size of a blob in bytes
    Size {
        /// Blob reference
        reference: String,
    },
    /// List stored blobs
    Ls,
    /// Check whether a blob is stored (exit status 1 when it is not)
    Has {
        /// Blob reference
        reference: String,
    },
    /// Strictly decode a want message and print its entries
    CheckWants {
        /// Message file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(path) = cli.path {
        config.store.path = path;
    }
    init_logging(&config.log.level, cli.verbose);

    match cli.command {
        Commands::Put { file } => cmd::blob::put(&config, file.as_deref()),
        Commands::Get { reference, output } => {
            cmd::blob::get(&config, &reference, output.as_deref())
        }
        Commands::Rm { reference } => cmd::blob::rm(&config, &reference),
        Commands::Size { reference } => cmd::blob::size(&config, &reference),
        Commands::Ls => cmd::blob::ls(&config),
        Commands::Has { reference } => cmd::blob::has(&config, &reference),
        Commands::CheckWants { file } => cmd::wants::check(file.as_deref()),
        Commands::Config => cmd::config::show(&config, cli.config.as_deref()),
    }
}

fn init_logging(level: &str, verbose: u8) {
    let level = match verbose {
        0 => level.parse().unwrap_or(Level::WARN),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
