//! Creevey CLI - Main Entry Point
//!
//! Runs visual regression tests headless, serves the UI sync server, approves
//! failed images and hosts browser workers for the orchestrator.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{approve, run, serve, worker};

/// Creevey - visual regression for component stories
#[derive(Parser)]
#[command(name = "creevey")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "creevey.toml", env = "CREEVEY_CONFIG", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every test once and report the outcome
    Run(run::RunArgs),

    /// Start the UI server
    Serve(serve::ServeArgs),

    /// Approve failed images of the last run
    Approve(approve::ApproveArgs),

    /// Serve one browser worker over stdin/stdout
    #[command(hide = true)]
    Worker(worker::WorkerArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the worker protocol, so logs always go to stderr
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let passed = run::execute(args, &cli.config).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Serve(args) => serve::execute(args, &cli.config).await?,
        Commands::Approve(args) => approve::execute(args, &cli.config)?,
        Commands::Worker(args) => worker::execute(args, &cli.config).await?,
        Commands::Version => {
            println!("Creevey CLI v{}", creevey_common::VERSION);
        }
    }

    Ok(())
}
