//! Administrative CLI for the grant review orchestration core.
//!
//! Boots an orchestrator instance against the configured settings, runs a
//! single operation, prints the result as JSON, and exits. There is no
//! persistent server to attach to: this mirrors a one-shot admin script run
//! against an otherwise-embedded orchestrator.

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grant_orchestrator::agent::AgentType;
use grant_orchestrator::config;
use grant_orchestrator::domain_types::{GrantAmount, GrantId};
use grant_orchestrator::orchestrator::Orchestrator;
use grant_orchestrator::store::NewGrant;
use grant_orchestrator::time_provider::production_time_provider;
use rust_decimal::Decimal;

/// Administrative commands for the grant review orchestration core.
#[derive(Parser)]
#[command(name = "grant-orchestrator-cli", version, about)]
struct Cli {
    /// Path to a TOML configuration file. Falls back to defaults and
    /// environment overrides when omitted.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submits a new grant application and prints its assigned id.
    SubmitGrant {
        /// Submitting wallet or account identifier.
        #[arg(long)]
        applicant: String,
        /// IPFS hash of the full application document.
        #[arg(long)]
        ipfs_hash: String,
        /// Human-readable project name.
        #[arg(long)]
        project_name: String,
        /// Short description of the proposed work.
        #[arg(long)]
        description: String,
        /// Requested amount, as a decimal string.
        #[arg(long)]
        amount: String,
    },
    /// Prints the workflow status for a single grant.
    WorkflowStatus {
        /// Numeric grant id.
        #[arg(long)]
        grant_id: u64,
    },
    /// Lists every workflow that has not yet reached a terminal stage.
    ActiveWorkflows,
    /// Prints health for one agent type, or every agent type if omitted.
    AgentHealth {
        /// Restrict the report to a single agent type.
        #[arg(long)]
        agent_type: Option<String>,
    },
    /// Prints aggregate orchestrator statistics.
    Stats,
    /// Prints the worst-of-all-agents system health summary.
    SystemHealth,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;
    let orchestrator = Orchestrator::new(config, production_time_provider());
    orchestrator.start().await?;

    let output = run(&orchestrator, cli.command).await;

    orchestrator.shutdown().await;

    let output = output?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(orchestrator: &std::sync::Arc<Orchestrator>, command: Command) -> Result<serde_json::Value> {
    match command {
        Command::SubmitGrant {
            applicant,
            ipfs_hash,
            project_name,
            description,
            amount,
        } => {
            let amount = GrantAmount::try_new(
                Decimal::from_str(&amount).context("amount must be a decimal number")?,
            )
            .map_err(|err| anyhow::anyhow!("invalid amount: {err}"))?;
            let grant_id = orchestrator
                .process_new_grant(NewGrant {
                    id: None,
                    applicant,
                    ipfs_hash,
                    project_name,
                    description,
                    amount,
                })
                .await?;
            Ok(serde_json::json!({ "grant_id": grant_id.to_string() }))
        }
        Command::WorkflowStatus { grant_id } => {
            let grant_id = GrantId::try_from(grant_id).context("invalid grant id")?;
            let status = orchestrator.get_workflow_status(grant_id);
            Ok(serde_json::to_value(status)?)
        }
        Command::ActiveWorkflows => Ok(serde_json::to_value(orchestrator.get_active_workflows())?),
        Command::AgentHealth { agent_type } => {
            let agent_type = agent_type
                .map(|name| parse_agent_type(&name))
                .transpose()?;
            Ok(serde_json::to_value(orchestrator.get_agent_health(agent_type))?)
        }
        Command::Stats => Ok(serde_json::to_value(orchestrator.get_stats())?),
        Command::SystemHealth => Ok(serde_json::to_value(orchestrator.get_system_health())?),
    }
}

fn parse_agent_type(name: &str) -> Result<AgentType> {
    AgentType::all()
        .into_iter()
        .find(|candidate| format!("{candidate:?}").eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("unknown agent type: {name}"))
}
