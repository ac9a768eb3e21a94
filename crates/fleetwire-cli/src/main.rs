//! fleetwire CLI: run a relay, a controller or a demo agent.

mod cli;
mod cmd;
mod config;
mod console;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing(level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::try_new(level.unwrap_or("info"))
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            }),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();

    let (config, source) = match config::load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    };
    init_tracing(config.log_level.as_deref());
    if let Some(path) = source {
        tracing::info!(path = %path.display(), "Loaded configuration");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Relay { .. } => cmd::run_relay(config).await,
            Commands::Controller { listen, .. } => cmd::run_controller(config, listen).await,
            Commands::Agent { .. } => cmd::run_agent(config).await,
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
