//! PBD CLI
//!
//! Command-line tools for persistent binary deque directories.
//!
//! # Commands
//!
//! - `inspect` - Display the segment table of a deque
//! - `verify` - CRC-check every segment and entry

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Persistent binary deque command-line tools.
#[derive(Parser)]
#[command(name = "pbd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the deque directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Deque nonce (the file-name prefix of its segments)
    #[arg(global = true, short, long)]
    nonce: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the segment table of a deque
    Inspect,

    /// CRC-check every segment header and entry
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect => {
            let path = cli.path.ok_or("Deque path required for inspect")?;
            let nonce = cli.nonce.ok_or("Deque nonce required for inspect")?;
            commands::inspect::run(&path, &nonce)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Deque path required for verify")?;
            let nonce = cli.nonce.ok_or("Deque nonce required for verify")?;
            commands::verify::run(&path, &nonce)?;
        }
        Commands::Version => {
            println!("PBD CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
