mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use swarmforge_core::Payload;
use swarmforge_engine::{Orchestrator, OrchestratorConfig, ProcessSpawner};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = OrchestratorConfig::default();
    if let Some(path) = &cli.config {
        config = config
            .merge_file(path)
            .with_context(|| format!("loading config file {path:?}"))?;
    }
    cli.apply_overrides(&mut config)
        .context("applying CLI/environment overrides")?;

    let seed_bytes = std::fs::read(&cli.seed)
        .with_context(|| format!("reading seed file {:?}", cli.seed))?;
    let seed = Payload::new(seed_bytes);

    let spawner = Arc::new(ProcessSpawner::new(cli.worker_cmd.clone(), cli.worker_args.clone()));
    let orchestrator = Orchestrator::new(config, spawner)
        .await
        .context("initializing orchestrator")?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "orchestrator event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let report = orchestrator.run(seed).await.context("running workflow")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}
