//! Kolosal NAS - Main Entry Point
//!
//! Runs a differentiable architecture search from JSON configs.

use clap::Parser;
use kolosal_nas::cli::{run, Cli};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_nas=info".into()),
        )
        .init();

    let cli = Cli::parse();
    run(&cli)?;

    Ok(())
}
