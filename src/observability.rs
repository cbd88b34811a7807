//! Observability: the named events the orchestration core emits
//!
//! Events are broadcast on a `tokio::sync::broadcast` channel so any number
//! of observers (admin surface, tests, logging sinks) can subscribe without
//! coupling the emitting component to a specific consumer.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::trace;

use crate::agent::AgentType;
use crate::domain_types::{GrantId, MessageId};
use crate::workflow::WorkflowStage;

/// Default channel capacity; slow consumers drop the oldest events rather
/// than back-pressure the components emitting them.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The canonical named events the orchestration core emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A message was accepted onto the bus queue.
    MessageQueued {
        /// The id of the queued message.
        message_id: MessageId,
    },
    /// A message was rejected because the queue was at capacity.
    MessageDropped {
        /// Why the message was dropped.
        reason: String,
    },
    /// A message was confirmed delivered to every resolved recipient.
    MessageDelivered {
        /// The id of the delivered message.
        message_id: MessageId,
    },
    /// A message exhausted its retry budget.
    MessageFailed {
        /// The id of the failed message.
        message_id: MessageId,
        /// How many retries were attempted before giving up.
        retry_count: u32,
    },
    /// A message is being retried after a transient delivery failure.
    MessageRetry {
        /// The id of the message being retried.
        message_id: MessageId,
        /// The retry attempt number.
        retry_count: u32,
    },
    /// An unexpected error occurred while processing a message.
    MessageError {
        /// The id of the message that errored.
        message_id: MessageId,
        /// A description of the error.
        error: String,
    },
    /// A workflow was created for a newly submitted grant.
    WorkflowStarted {
        /// The grant the workflow was created for.
        grant_id: GrantId,
    },
    /// A workflow's evaluation progress advanced.
    EvaluationProgress {
        /// The grant whose evaluation progressed.
        grant_id: GrantId,
        /// The updated progress percentage.
        progress: u8,
    },
    /// A workflow's evaluation deadline elapsed with votes still missing.
    EvaluationTimeout {
        /// The grant whose evaluation timed out.
        grant_id: GrantId,
        /// The agent types that never voted.
        missing: Vec<AgentType>,
    },
    /// A workflow failed during evaluation for a reason other than timeout.
    EvaluationFailed {
        /// The grant whose evaluation failed.
        grant_id: GrantId,
        /// Why the evaluation failed.
        reason: String,
    },
    /// A workflow reached its terminal successful stage.
    WorkflowComplete {
        /// The grant whose workflow completed.
        grant_id: GrantId,
    },
    /// A workflow reached its terminal failure stage.
    WorkflowFailed {
        /// The grant whose workflow failed.
        grant_id: GrantId,
        /// Why the workflow failed.
        reason: String,
    },
    /// An unhealthy agent was successfully re-registered.
    AgentRecovered {
        /// The agent type that recovered.
        agent_type: AgentType,
    },
    /// An attempt to recover an unhealthy agent failed.
    AgentRecoveryFailed {
        /// The agent type that failed to recover.
        agent_type: AgentType,
        /// Why recovery failed.
        reason: String,
    },
    /// An agent's health degraded below the healthy threshold.
    HealthDegraded {
        /// The agent type whose health degraded.
        agent_type: AgentType,
    },
    /// The orchestrator completed startup.
    OrchestratorStarted,
    /// The orchestrator began graceful shutdown.
    OrchestratorShutdown,
    /// A workflow stage transition, useful to observers tracking progress
    /// monotonicity independent of the more specific events above.
    WorkflowStageChanged {
        /// The grant whose workflow stage changed.
        grant_id: GrantId,
        /// The stage the workflow transitioned to.
        stage: WorkflowStage,
    },
}

/// Shared event broadcaster. Cheap to clone; every clone shares the same
/// underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new event bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus with an explicit channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event. A lack of subscribers is not an error.
    pub fn emit(&self, event: Event) {
        trace!(?event, "event emitted");
        let _ = self.sender.send(event);
    }

    /// Subscribes to future events. Events emitted before this call are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A structured record suitable for the tracing-subscriber JSON layer, kept
/// distinct from [`Event`] so log shipping can evolve independently of the
/// in-process pub/sub contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the record was produced.
    pub timestamp: SystemTime,
    /// The event that triggered this record.
    pub event: String,
    /// Free-form structured detail.
    pub detail: serde_json::Value,
}
