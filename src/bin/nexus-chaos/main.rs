//! nexus-chaos - node-loss scenarios against replicated nexus volumes.
//!
//! # Usage
//!
//! ```bash
//! # Isolate a replica node of a volume while fio is running
//! nexus-chaos run loss-while-active --volume 0b2c6a9e-4f57-4b51-9f4b-7c1b2a1f0e11
//!
//! # Same scenario against the in-memory cluster, as JSON
//! nexus-chaos --json run loss-with-reassignment --simulate
//!
//! # Clean up after an interrupted run
//! nexus-chaos reconnect --node ksnode-2 --peers 192.168.122.101,192.168.122.103
//! ```

mod cli;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// `quiet` turns logging off, `verbose` enables debug; otherwise `RUST_LOG`
/// or warn.
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.is_quiet, cli.global.is_verbose);
    cli.run().await
}
