//! Wire types for the Message Router and Message Bus.
//!
//! Every `MessageType` carries a typed [`MessagePayload`] variant instead
//! of an untyped map, so a malformed payload is a compile error rather than
//! a runtime surprise.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::agent::AgentType;
use crate::domain_types::{Confidence, GrantAmount, GrantId, MessageId, Score};
use crate::store::VotingResult;

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// A single agent type.
    One(AgentType),
    /// Several agent types, all of which must receive the message.
    Many(Vec<AgentType>),
    /// Every currently active agent.
    Broadcast,
}

impl Recipient {
    /// The agent types this recipient denotes, resolved against nothing
    /// external — `Broadcast` returns an empty list; callers must resolve it
    /// against the registry.
    #[must_use]
    pub fn explicit_types(&self) -> Vec<AgentType> {
        match self {
            Recipient::One(t) => vec![*t],
            Recipient::Many(ts) => ts.clone(),
            Recipient::Broadcast => Vec::new(),
        }
    }
}

/// A minimal grant snapshot carried on the wire to evaluators, decoupled
/// from the Data Store's own `Grant` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSummary {
    /// The grant's id.
    pub grant_id: GrantId,
    /// The applicant's identifier (wallet address, account id, etc).
    pub applicant: String,
    /// Content hash for off-chain application material.
    pub ipfs_hash: String,
    /// Human-readable project name.
    pub project_name: String,
    /// Free-text project description.
    pub description: String,
    /// Requested funding amount.
    pub amount: GrantAmount,
}

/// The approval or rejection an `ApprovalDecision` message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The grant cleared the decision law.
    Approved,
    /// The grant did not clear the decision law.
    Rejected,
}

/// Typed payload for every message type the protocol defines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Intake notification sent when a grant is first submitted.
    NewGrant {
        /// The submitted grant's id.
        grant_id: GrantId,
        /// A snapshot of the grant data.
        grant_data: GrantSummary,
    },
    /// Fan-out request sent to each evaluator agent type.
    EvaluationRequest {
        /// The grant under evaluation.
        grant_id: GrantId,
        /// A snapshot of the grant data.
        grant_data: GrantSummary,
        /// When the request was issued.
        requested_at: SystemTime,
        /// How long the evaluator has before the workflow times it out.
        timeout: std::time::Duration,
    },
    /// Optional explicit completion marker an evaluator may send in addition
    /// to `VoteCast`.
    EvaluationComplete {
        /// The grant that was evaluated.
        grant_id: GrantId,
        /// Which evaluator produced the vote.
        agent_type: AgentType,
    },
    /// An evaluator's vote for a grant.
    VoteCast {
        /// The grant being voted on.
        grant_id: GrantId,
        /// The numeric score, in `[0, 100]`.
        score: Score,
        /// The evaluator's written rationale.
        reasoning: String,
        /// The evaluator's confidence in its own score.
        confidence: Confidence,
        /// Concerns raised by the evaluator.
        concerns: Vec<String>,
        /// Recommendations raised by the evaluator.
        recommendations: Vec<String>,
    },
    /// Final decision sent to the executor once voting concludes.
    ApprovalDecision {
        /// The decided grant.
        grant_id: GrantId,
        /// Approved or rejected.
        decision: Decision,
        /// The aggregated voting result backing the decision.
        voting_result: VotingResult,
    },
    /// Emitted when a milestone is created for an approved grant.
    MilestoneCreated {
        /// The grant the milestone belongs to.
        grant_id: GrantId,
        /// Free-form milestone description, owned by the executor agent.
        description: String,
        /// The portion of the grant amount released at this milestone.
        amount: Decimal,
    },
    /// Periodic system status broadcast.
    SystemStatus {
        /// Free-form status payload.
        detail: String,
    },
}

impl MessagePayload {
    /// The grant this payload concerns, if any — used to route delivered
    /// messages to the right workflow.
    #[must_use]
    pub fn grant_id(&self) -> Option<GrantId> {
        match self {
            MessagePayload::NewGrant { grant_id, .. }
            | MessagePayload::EvaluationRequest { grant_id, .. }
            | MessagePayload::EvaluationComplete { grant_id, .. }
            | MessagePayload::VoteCast { grant_id, .. }
            | MessagePayload::ApprovalDecision { grant_id, .. }
            | MessagePayload::MilestoneCreated { grant_id, .. } => Some(*grant_id),
            MessagePayload::SystemStatus { .. } => None,
        }
    }

    /// A short tag naming this payload's `MessageType`, used for history
    /// filters and event-subscription topics.
    #[must_use]
    pub fn kind(&self) -> MessageType {
        match self {
            MessagePayload::NewGrant { .. } => MessageType::NewGrant,
            MessagePayload::EvaluationRequest { .. } => MessageType::EvaluationRequest,
            MessagePayload::EvaluationComplete { .. } => MessageType::EvaluationComplete,
            MessagePayload::VoteCast { .. } => MessageType::VoteCast,
            MessagePayload::ApprovalDecision { .. } => MessageType::ApprovalDecision,
            MessagePayload::MilestoneCreated { .. } => MessageType::MilestoneCreated,
            MessagePayload::SystemStatus { .. } => MessageType::SystemStatus,
        }
    }
}

/// Tag-only view of [`MessagePayload`], used wherever only the kind of
/// message matters (history filters, subscriptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// See [`MessagePayload::NewGrant`].
    NewGrant,
    /// See [`MessagePayload::EvaluationRequest`].
    EvaluationRequest,
    /// See [`MessagePayload::EvaluationComplete`].
    EvaluationComplete,
    /// See [`MessagePayload::VoteCast`].
    VoteCast,
    /// See [`MessagePayload::ApprovalDecision`].
    ApprovalDecision,
    /// See [`MessagePayload::MilestoneCreated`].
    MilestoneCreated,
    /// See [`MessagePayload::SystemStatus`].
    SystemStatus,
}

/// A routed message: a payload with identity, origin, and destination
/// attached by the Message Router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique id assigned at routing time.
    pub id: MessageId,
    /// The sending agent type.
    pub from: AgentType,
    /// The intended recipient(s).
    pub to: Recipient,
    /// The typed payload.
    pub payload: MessagePayload,
    /// When the message was routed.
    pub timestamp: SystemTime,
}

/// Delivery priority. Ordered so `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest priority; delivered only once nothing higher is pending.
    Low = 0,
    /// Default priority for routine traffic.
    Normal = 1,
    /// Used for evaluation requests and intake notifications.
    High = 2,
    /// Reserved for messages that must overtake everything else queued.
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

static QUEUE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A message wrapped with bus bookkeeping: priority, retry state, and
/// delivery timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// The underlying routed message.
    pub message: Message,
    /// Delivery priority.
    pub priority: Priority,
    /// Attempts made so far.
    pub retry_count: u32,
    /// Maximum attempts before this message is marked failed.
    pub max_retries: u32,
    /// When this message entered the queue.
    pub created_at: SystemTime,
    /// When the bus last picked this message up for processing.
    pub processing_started_at: Option<SystemTime>,
    /// When this message was confirmed delivered.
    pub delivered_at: Option<SystemTime>,
    /// The error recorded if delivery ultimately failed.
    pub error: Option<String>,
    /// Arrival sequence number, used only to break `(priority, created_at)`
    /// ties deterministically.
    sequence: u64,
}

impl QueuedMessage {
    /// Wraps a routed message for enqueueing.
    #[must_use]
    pub fn new(message: Message, priority: Priority, max_retries: u32, created_at: SystemTime) -> Self {
        Self {
            message,
            priority,
            retry_count: 0,
            max_retries,
            created_at,
            processing_started_at: None,
            delivered_at: None,
            error: None,
            sequence: QUEUE_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Whether another retry attempt is permitted.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    /// Orders by `(priority desc, created_at asc, sequence asc)` so a
    /// `BinaryHeap<QueuedMessage>` pops the highest-priority, oldest message
    /// first, with arrival order as the final tie-break.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Filter used by [`crate::message::router::MessageRouter::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to messages sent by this agent type.
    pub from: Option<AgentType>,
    /// Restrict to messages addressed to this agent type.
    pub to: Option<AgentType>,
    /// Restrict to this message kind.
    pub message_type: Option<MessageType>,
    /// Cap the number of results returned (most recent first).
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, message: &Message) -> bool {
        if let Some(from) = self.from
            && message.from != from
        {
            return false;
        }
        if let Some(to) = self.to {
            let addressed = match &message.to {
                Recipient::One(t) => *t == to,
                Recipient::Many(ts) => ts.contains(&to),
                Recipient::Broadcast => true,
            };
            if !addressed {
                return false;
            }
        }
        if let Some(message_type) = self.message_type
            && message.payload.kind() != message_type
        {
            return false;
        }
        true
    }

    /// Applies this filter to a history slice, honoring `limit` on the tail.
    #[must_use]
    pub fn apply(&self, history: &[Message]) -> Vec<Message> {
        let matched: Vec<Message> = history.iter().filter(|m| self.matches(m)).cloned().collect();
        match self.limit {
            Some(limit) if matched.len() > limit => matched[matched.len() - limit..].to_vec(),
            _ => matched,
        }
    }
}

/// Resolves the set of active agent instances a [`Recipient`] should reach,
/// given a snapshot of active agent types (used by both broadcast resolution
/// and bus availability checks).
#[must_use]
pub fn recipient_types(recipient: &Recipient, active_types: &HashSet<AgentType>) -> Vec<AgentType> {
    match recipient {
        Recipient::Broadcast => active_types.iter().copied().collect(),
        other => other.explicit_types(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::time::Duration;

    fn sample_message(from: AgentType, to: Recipient) -> Message {
        Message {
            id: MessageId::generate(),
            from,
            to,
            payload: MessagePayload::SystemStatus {
                detail: "test".to_string(),
            },
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn higher_priority_pops_first_regardless_of_arrival() {
        let now = SystemTime::now();
        let mut heap = BinaryHeap::new();
        for _ in 0..5 {
            heap.push(QueuedMessage::new(
                sample_message(AgentType::Coordinator, Recipient::Broadcast),
                Priority::Normal,
                3,
                now,
            ));
        }
        heap.push(QueuedMessage::new(
            sample_message(AgentType::Coordinator, Recipient::Broadcast),
            Priority::Critical,
            3,
            now + Duration::from_secs(1),
        ));
        assert_eq!(heap.pop().unwrap().priority, Priority::Critical);
    }

    #[test]
    fn equal_priority_breaks_tie_by_arrival_order() {
        let now = SystemTime::now();
        let mut heap = BinaryHeap::new();
        let first = QueuedMessage::new(
            sample_message(AgentType::Coordinator, Recipient::Broadcast),
            Priority::Normal,
            3,
            now,
        );
        let first_id = first.message.id.clone();
        heap.push(first);
        heap.push(QueuedMessage::new(
            sample_message(AgentType::Coordinator, Recipient::Broadcast),
            Priority::Normal,
            3,
            now,
        ));
        assert_eq!(heap.pop().unwrap().message.id, first_id);
    }
}
