//! # grant-orchestrator - Grant Review Evaluation Orchestration Core
//!
//! This crate coordinates the lifecycle of a grant application from
//! submission through evaluation, voting, decision, and execution, across a
//! fixed set of cooperating agent types (intake, evaluators, coordinator,
//! executor). It owns no agent's domain logic — only the registry,
//! messaging, state, and workflow machinery that let those agents
//! cooperate.
//!
//! ## Core Components
//!
//! - **Domain types**: validated newtypes for ids, scores, confidence, and
//!   amounts ([`domain_types`])
//! - **Agent Registry**: directory of live agent instances and their
//!   capabilities ([`registry`])
//! - **Messaging**: typed envelopes routed and queued between agents
//!   ([`message`])
//! - **Data Store**: in-memory grants, evaluations, and the decision law
//!   ([`store`])
//! - **Workflow Engine**: the per-grant stage machine ([`workflow`])
//! - **Orchestrator**: the composition root wiring the above into a running
//!   system ([`orchestrator`])
//! - **Observability**: structured events and logging ([`observability`])
//!
//! ## Architecture
//!
//! ```no_run
//! use grant_orchestrator::orchestrator::{Orchestrator, OrchestratorConfig};
//! use grant_orchestrator::time_provider::production_time_provider;
//! use grant_orchestrator::store::NewGrant;
//! use grant_orchestrator::domain_types::GrantAmount;
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default(), production_time_provider());
//!     orchestrator.start().await?;
//!
//!     let grant_id = orchestrator
//!         .process_new_grant(NewGrant {
//!             id: None,
//!             applicant: "alice.eth".to_string(),
//!             ipfs_hash: "Qm...".to_string(),
//!             project_name: "Example".to_string(),
//!             description: "A grant application.".to_string(),
//!             amount: GrantAmount::try_new(Decimal::from(1000))?,
//!         })
//!         .await?;
//!     println!("submitted {grant_id}");
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod message;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod time_provider;
pub mod workflow;

pub use crate::error::OrchestratorError;
pub use crate::orchestrator::{Orchestrator, OrchestratorConfig};

// Common imports mirrored across the crate's modules.
pub use ::tracing::{debug, error, info, instrument, warn};
pub use serde::{Deserialize, Serialize};
pub use std::time::Duration;
pub use thiserror::Error;
pub use uuid::Uuid;
