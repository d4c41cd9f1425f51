//! Command-line client for KServe v2 / Triton inference servers.

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;
use tritonstream_core::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::run(cli) {
        error!(error = %e, "Command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
