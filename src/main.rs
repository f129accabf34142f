//! stagecrew CLI entry point.
//!
//! Initializes logging and delegates to the CLI module, mapping the run
//! outcome to the process exit code.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Parse CLI arguments first to get log_level
    let cli = stagecrew::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    match stagecrew::cli::run_with_cli(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Definition loading faults land here; everything else becomes
            // a RunReport with its own return code.
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}
