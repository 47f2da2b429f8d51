//! TideSync CLI
//!
//! Operator tools for the files a TideSync deployment leaves on disk.
//!
//! # Commands
//!
//! - `inspect` - Describe a batch or snapshot directory
//! - `clean` - Remove stale round directories under a batch root
//! - `timestamp` - Decode a store timestamp into its canonical value

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tidesync_engine::protocol::TimestampEncoding;
use tracing_subscriber::EnvFilter;

/// TideSync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe a batch or snapshot directory
    Inspect {
        /// Directory holding the batch summary
        path: PathBuf,

        /// Count row states in every part
        #[arg(short, long)]
        rows: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove stale round directories under a batch root
    Clean {
        /// Batch root (the `batch_directory` option)
        path: PathBuf,

        /// Only remove rounds idle for at least this many seconds
        #[arg(short, long, default_value = "3600")]
        older_than: u64,

        /// Dry run - show what would be removed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Decode a store timestamp
    Timestamp {
        /// Raw value; bytes are given as hex
        value: String,

        /// Shape the store reported the value in
        #[arg(short, long, value_enum, default_value = "integer")]
        encoding: Encoding,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum Encoding {
    Integer,
    Hex,
    Bytes,
}

impl From<Encoding> for TimestampEncoding {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Integer => TimestampEncoding::Integer,
            Encoding::Hex => TimestampEncoding::HexString,
            Encoding::Bytes => TimestampEncoding::Bytes,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { path, rows, format } => {
            commands::inspect::run(&path, rows, &format)?;
        }
        Commands::Clean {
            path,
            older_than,
            dry_run,
        } => {
            commands::clean::run(&path, Duration::from_secs(older_than), dry_run)?;
        }
        Commands::Timestamp { value, encoding } => {
            commands::timestamp::run(&value, encoding.into())?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Protocol version {}", tidesync_engine::protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
