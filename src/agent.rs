//! Agent-facing domain types shared across the registry, bus, and workflow engine.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::domain_types::AgentInstanceId;

/// Closed enumeration of agent roles the orchestration core knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Performs intake processing when a grant is first submitted.
    Intake,
    /// Evaluates technical feasibility.
    Technical,
    /// Evaluates ecosystem impact.
    Impact,
    /// Researches the applicant team.
    DueDiligence,
    /// Evaluates budget and cost.
    Budget,
    /// Gauges community sentiment.
    Community,
    /// Orchestrates workflow decisions (reserved for future coordinator agents).
    Coordinator,
    /// Executes approved decisions (fund release, milestone tracking).
    Executor,
}

impl AgentType {
    /// The five evaluator roles a grant's vote aggregation depends on.
    #[must_use]
    pub const fn evaluators() -> [AgentType; 5] {
        [
            AgentType::Technical,
            AgentType::Impact,
            AgentType::DueDiligence,
            AgentType::Budget,
            AgentType::Community,
        ]
    }

    /// All agent types the Orchestrator boots one instance of at startup.
    #[must_use]
    pub const fn all() -> [AgentType; 8] {
        [
            AgentType::Intake,
            AgentType::Technical,
            AgentType::Impact,
            AgentType::DueDiligence,
            AgentType::Budget,
            AgentType::Community,
            AgentType::Coordinator,
            AgentType::Executor,
        ]
    }

    /// The capability tags discovery exposes for this agent type.
    #[must_use]
    pub const fn capabilities(self) -> &'static [&'static str] {
        match self {
            AgentType::Intake => &["grant_submission", "ipfs_upload", "blockchain_write"],
            AgentType::Technical => {
                &["technical_analysis", "code_review", "architecture_evaluation"]
            }
            AgentType::Impact => &["impact_assessment", "ecosystem_analysis", "alignment_check"],
            AgentType::DueDiligence => &["team_research", "github_analysis", "reputation_check"],
            AgentType::Budget => &["budget_analysis", "cost_comparison", "milestone_generation"],
            AgentType::Community => {
                &["sentiment_analysis", "poll_management", "community_feedback"]
            }
            AgentType::Coordinator => {
                &["workflow_orchestration", "decision_making", "agent_coordination"]
            }
            AgentType::Executor => &["fund_release", "milestone_tracking", "blockchain_execution"],
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentType::Intake => "intake",
            AgentType::Technical => "technical",
            AgentType::Impact => "impact",
            AgentType::DueDiligence => "due_diligence",
            AgentType::Budget => "budget",
            AgentType::Community => "community",
            AgentType::Coordinator => "coordinator",
            AgentType::Executor => "executor",
        };
        f.write_str(name)
    }
}

/// Liveness state of a registered agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered and eligible to receive messages.
    Active,
    /// Registered but currently processing and not eligible for new work.
    Busy,
    /// Registered but not currently reachable.
    Inactive,
}

/// A single registered agent instance, owned by the Agent Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Caller-supplied unique id for this instance.
    pub id: AgentInstanceId,
    /// The role this instance plays.
    pub agent_type: AgentType,
    /// Current liveness state.
    pub status: AgentStatus,
    /// When this instance registered.
    pub connected_at: SystemTime,
    /// Last time this instance's activity was observed.
    pub last_activity: SystemTime,
    /// Running count of evaluations this instance has produced.
    pub evaluations_count: u64,
}

impl AgentInfo {
    /// Creates a freshly registered, active agent record.
    #[must_use]
    pub fn new(id: AgentInstanceId, agent_type: AgentType, now: SystemTime) -> Self {
        Self {
            id,
            agent_type,
            status: AgentStatus::Active,
            connected_at: now,
            last_activity: now,
            evaluations_count: 0,
        }
    }
}
