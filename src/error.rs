//! Error taxonomy for the orchestration core.
//!
//! Each component defines its own error enum close to where it is raised;
//! this module only carries the top-level error the Orchestrator surfaces to
//! its callers, composed from the component errors via `#[from]`.

use thiserror::Error;

use crate::message::BusError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::workflow::WorkflowError;

/// Errors the Orchestrator can return from its public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A validation error: malformed grant, unknown agent type, out-of-range score.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Forwarded from the agent registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Forwarded from the message bus.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Forwarded from the data store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Forwarded from the workflow engine.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// No workflow is registered for the requested grant id.
    #[error("unknown workflow for grant {0}")]
    UnknownWorkflow(crate::domain_types::GrantId),
}
