mod cli;
mod commands;
mod config;
mod error;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{Level, debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::{CommandExecutor, FetchOptions};
use crate::config::AppConfig;
use crate::error::Result;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;
    debug!(?config, "Starting pixflow");

    let mut settings = config.pipeline_settings(args.cache_dir);
    if let Commands::Fetch {
        progressive: true, ..
    } = args.command
    {
        settings.is_progressive_decoding_enabled = true;
    }
    let executor = CommandExecutor::new(settings)?;

    match args.command {
        Commands::Fetch {
            urls,
            output_dir,
            resize,
            crop,
            circle,
            rounded,
            reload,
            ..
        } => {
            let output_dir = output_dir
                .or(config.output_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            let options = FetchOptions {
                resize,
                crop,
                circle,
                rounded,
                reload,
            };
            executor.fetch(urls, &output_dir, &options).await?;
        }
        Commands::Prefetch {
            urls,
            destination,
            max_concurrent,
        } => {
            executor.prefetch(urls, destination, max_concurrent).await?;
        }
        Commands::Cache { action } => executor.cache(action)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}
