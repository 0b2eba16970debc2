use std::time::Duration;

use adk_bidi_cli::cli::{Cli, Commands};
use adk_bidi_cli::harness::{self, Settings};
use adk_bidi_cli::{logging, serve};
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, closing bridge.");
            Ok(())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_cli(&cli);
    tracing::info!(
        backend = ?cli.backend,
        model_id = %settings.config.model_id,
        region = %settings.config.region,
        voice = %settings.config.voice,
        "bidi-bridge starting"
    );

    match &cli.command {
        Commands::Serve { host, port } => {
            serve::run_serve(settings.model.clone(), settings.config.clone(), host, *port).await
        }
        Commands::Connect { pcm, timeout_secs } => {
            harness::run_connect(&settings, pcm, Duration::from_secs(*timeout_secs)).await
        }
        Commands::Latency { pcm, runs, timeout_secs } => {
            harness::run_latency(&settings, pcm, *runs, Duration::from_secs(*timeout_secs)).await
        }
        Commands::BargeIn { question, interrupt, threshold, timeout_secs } => {
            let timeout = Duration::from_secs(*timeout_secs);
            harness::run_barge_in(&settings, question, interrupt, *threshold, timeout).await
        }
        Commands::Tools { test, time_pcm, calc_pcm, timeout_secs } => {
            let timeout = Duration::from_secs(*timeout_secs);
            harness::run_tools(&settings, *test, time_pcm, calc_pcm, timeout).await
        }
    }
}
