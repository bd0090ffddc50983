//! Tessera CLI - Main entry point

use anyhow::Context;
use clap::Parser;
use std::process;
use tessera_cli::Cli;
use tessera_common::logging::init_logging;
use tracing::error;

#[tokio::main]
async fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Handle markdown help generation
    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    // Values from .env never override variables already set
    let _ = dotenvy::dotenv();

    let log_config = match cli.log_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        },
    };
    // The CLI works without logging, so a failed setup is not fatal
    let log_guard = init_logging(&log_config).ok();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };
    // Flush file logs before exiting
    drop(log_guard);
    process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    tessera_cli::app::execute(cli).await.with_context(|| match &cli.config_file {
        Some(path) => format!("ingest with '{}' did not finish", path.display()),
        None => "ingest did not start".to_string(),
    })
}
