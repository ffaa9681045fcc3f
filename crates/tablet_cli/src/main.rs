//! Tablet CLI
//!
//! Command-line tools for tablet directories.
//!
//! # Commands
//!
//! - `create` - Create an empty tablet with a schema
//! - `put` / `delete` - Apply single-row writes
//! - `scan` - Print rows, optionally as of a past timestamp
//! - `inspect` - Display row sets, stores and counters
//! - `verify` - Replay every stored history and check consistency
//! - `flush` - Flush the mutable store or the largest DMS
//! - `compact` - Run delta, row set or scheduled compaction
//! - `dump-wal` - Dump WAL batches for debugging
//! - `fuzz` - Run randomized cases against a scratch tablet

mod commands;

use clap::{Parser, Subcommand};
use commands::compact::CompactTarget;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tablet storage command-line tools.
#[derive(Parser)]
#[command(name = "tablet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the tablet directory
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
    /// Create an empty tablet
    Create {
        /// Key column names, in key order
        #[arg(short, long, required = true, value_delimiter = ',')]
        keys: Vec<String>,

        /// Non-key column names
        #[arg(short = 'c', long, value_delimiter = ',')]
        values: Vec<String>,
    },

    /// Insert or upsert one row
    Put {
        /// Key column values, comma separated
        key: String,

        /// Column assignments such as `val=5` or `val=null`
        assignments: Vec<String>,

        /// Overwrite an existing row instead of failing
        #[arg(short, long)]
        upsert: bool,
    },

    /// Delete one row
    Delete {
        /// Key column values, comma separated
        key: String,
    },

    /// Print rows
    Scan {
        /// Read as of this timestamp instead of now
        #[arg(short, long)]
        at: Option<u64>,

        /// Maximum number of rows to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display tablet statistics and metadata
    Inspect {
        /// Show per row set details
        #[arg(short, long)]
        rowsets: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify tablet consistency
    Verify,

    /// Flush in-memory data to disk
    Flush {
        /// Flush the largest DMS instead of the mutable store
        #[arg(short, long)]
        deltas: bool,
    },

    /// Run a compaction
    Compact {
        /// What to compact
        #[arg(value_enum, default_value = "maintenance")]
        target: CompactTarget,

        /// Fold REDO history only up to this timestamp (major only)
        #[arg(long)]
        up_to: Option<u64>,
    },

    /// Dump WAL batches for debugging
    DumpWal {
        /// Maximum number of batches to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run randomized fuzz cases against a scratch tablet
    Fuzz {
        /// Seed of the first case
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Number of cases
        #[arg(short, long, default_value = "10")]
        runs: u64,

        /// Minimum operations per case
        #[arg(short, long, default_value = "50")]
        len: usize,

        /// Use a key-only schema and key-only operations
        #[arg(long)]
        pk_only: bool,

        /// Repeat every update this many times inside its batch
        #[arg(long, default_value = "1")]
        update_multiplier: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Create { keys, values } => {
            let path = cli.path.ok_or("Tablet path required for create")?;
            commands::write::create(&path, keys, values)?;
        }
        Commands::Put {
            key,
            assignments,
            upsert,
        } => {
            let path = cli.path.ok_or("Tablet path required for put")?;
            commands::write::put(&path, &key, &assignments, upsert)?;
        }
        Commands::Delete { key } => {
            let path = cli.path.ok_or("Tablet path required for delete")?;
            commands::write::delete(&path, &key)?;
        }
        Commands::Scan { at, limit, format } => {
            let path = cli.path.ok_or("Tablet path required for scan")?;
            commands::scan::run(&path, at, limit, &format)?;
        }
        Commands::Inspect { rowsets, format } => {
            let path = cli.path.ok_or("Tablet path required for inspect")?;
            commands::inspect::run(&path, rowsets, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Tablet path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Flush { deltas } => {
            let path = cli.path.ok_or("Tablet path required for flush")?;
            commands::compact::flush(&path, deltas)?;
        }
        Commands::Compact { target, up_to } => {
            let path = cli.path.ok_or("Tablet path required for compact")?;
            commands::compact::run(&path, target, up_to)?;
        }
        Commands::DumpWal {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Tablet path required for dump-wal")?;
            commands::dump_wal::run(&path, limit, offset, &format)?;
        }
        Commands::Fuzz {
            seed,
            runs,
            len,
            pk_only,
            update_multiplier,
        } => {
            commands::fuzz::run(seed, runs, len, pk_only, update_multiplier)?;
        }
        Commands::Version => {
            println!("Tablet CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Tablet Core v{}", tablet_core::VERSION);
        }
    }

    Ok(())
}
