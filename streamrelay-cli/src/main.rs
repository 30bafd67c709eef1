mod cli;
mod commands;
mod config;
mod error;

use crate::{
    cli::Args,
    commands::CommandExecutor,
    config::AppConfig,
    error::{AppError, Result},
};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_DIRECTIVES: &str = "streamrelay=info,streamrelay_engine=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `.env` first so clap's `env` attributes see its values.
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, args.json)?;

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_args(&args);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                shutdown.cancel();
            }
        });
    }

    let executor = CommandExecutor::new(config, args.json, shutdown);
    if let Err(e) = executor.execute(args.command).await {
        error!("Application error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool, json: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(verbose).with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}
