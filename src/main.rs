//! grant-orchestrator - Grant Review Evaluation Orchestration Core
//!
//! This is the main entry point for the orchestrator server process. It
//! loads configuration, boots the [`Orchestrator`], and runs until a
//! shutdown signal arrives.

use anyhow::Result;
use grant_orchestrator::config;
use grant_orchestrator::orchestrator::Orchestrator;
use grant_orchestrator::time_provider::production_time_provider;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grant_orchestrator=info".parse()?),
        )
        .init();

    info!("starting grant review orchestration core");

    let config_path = std::env::var("GRANT_ORCHESTRATOR_CONFIG").ok();
    let config = config::load(config_path.as_deref())?;
    info!(
        evaluation_timeout = ?config.evaluation_timeout,
        parallel_evaluations = config.parallel_evaluations,
        approval_threshold = %config.decision.approval_threshold,
        "configuration loaded"
    );

    let orchestrator = Orchestrator::new(config, production_time_provider());
    orchestrator.start().await?;
    info!("orchestrator started, accepting grants");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    orchestrator.shutdown().await;
    info!("orchestrator shut down gracefully");

    Ok(())
}
