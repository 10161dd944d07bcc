//! bucketsync CLI
//!
//! Command-line tools for bucketsync store directories.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and bucket state
//! - `verify` - Verify journal integrity and row consistency
//! - `compact` - Delete superseded entries and applied bucket removals
//! - `dump-oplog` - Dump stored oplog entries for debugging
//! - `crud` - List local writes waiting for upload

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// bucketsync command-line store tools.
#[derive(Parser)]
#[command(name = "bucketsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and metadata
    Inspect {
        /// Show per-bucket details
        #[arg(short, long)]
        buckets: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Verify store integrity
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Compact the oplog and rewrite the journal
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Dump stored oplog entries for debugging
    DumpOplog {
        /// Only dump this bucket
        #[arg(short, long)]
        bucket: Option<String>,

        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List local writes waiting for upload
    Crud {
        /// Maximum number of entries to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show version information
    Version,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = || cli.path.clone().ok_or("Store path required (--path)");

    match cli.command {
        Commands::Inspect { buckets, format } => {
            commands::inspect::run(&path()?, buckets, format)?;
        }
        Commands::Verify { format } => {
            if !commands::verify::run(&path()?, format)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Compact { dry_run, format } => {
            commands::compact::run(&path()?, dry_run, format)?;
        }
        Commands::DumpOplog {
            ref bucket,
            limit,
            format,
        } => {
            commands::dump_oplog::run(&path()?, bucket.as_deref(), limit, format)?;
        }
        Commands::Crud { limit, format } => {
            commands::crud::run(&path()?, limit, format)?;
        }
        Commands::Version => {
            println!("bucketsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Journal format v{}",
                bucketsync_store::JOURNAL_VERSION
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
