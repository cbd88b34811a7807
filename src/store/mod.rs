//! Data Store
//!
//! In-memory source of truth for grants and their evaluations, with an
//! optional write-through mirror to an external relational database.

pub mod bridge;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::instrument;

use crate::agent::AgentType;
use crate::domain_types::{Confidence, EvaluationId, GrantAmount, GrantId, Score};
use crate::store::bridge::ExternalDbBridge;
use crate::time_provider::SharedTimeProvider;

/// A grant's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Freshly submitted or mid-evaluation.
    Pending,
    /// All required evaluators have voted; aggregation is pending or done.
    UnderReview,
    /// The decision law found in favor of the grant.
    Approved,
    /// The decision law found against the grant.
    Rejected,
    /// An approved grant whose execution has finished.
    Completed,
}

/// Caller-supplied fields for [`DataStore::create_grant`].
#[derive(Debug, Clone)]
pub struct NewGrant {
    /// Caller-provided id, if the caller wants to pick one.
    pub id: Option<GrantId>,
    /// The applicant's identifier.
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

/// A grant application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Unique id within this process.
    pub id: GrantId,
    /// The applicant's identifier.
    pub applicant: String,
    /// Content hash for off-chain application material.
    pub ipfs_hash: String,
    /// Human-readable project name.
    pub project_name: String,
    /// Free-text project description.
    pub description: String,
    /// Requested funding amount.
    pub amount: GrantAmount,
    /// Current lifecycle status.
    pub status: GrantStatus,
    /// When the grant was created.
    pub created_at: SystemTime,
    /// When the grant's status was last changed.
    pub updated_at: Option<SystemTime>,
}

/// A single evaluator's assessment of a grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Unique id for this evaluation record.
    pub id: EvaluationId,
    /// The grant being evaluated.
    pub grant_id: GrantId,
    /// Which evaluator role produced this evaluation.
    pub agent_type: AgentType,
    /// The numeric score, in `[0, 100]`.
    pub score: Score,
    /// The evaluator's written rationale.
    pub reasoning: String,
    /// The evaluator's confidence in its own score.
    pub confidence: Confidence,
    /// Concerns raised by the evaluator.
    pub concerns: Vec<String>,
    /// Recommendations raised by the evaluator.
    pub recommendations: Vec<String>,
    /// When this evaluation was recorded.
    pub created_at: SystemTime,
}

/// One vote as it appears in a [`VotingResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRecord {
    /// The evaluator that cast this vote.
    pub agent_type: AgentType,
    /// The score cast.
    pub score: Score,
    /// When it was recorded.
    pub timestamp: SystemTime,
}

/// The aggregated outcome of a grant's evaluations. Derived
/// on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingResult {
    /// The grant this result concerns.
    pub grant_id: GrantId,
    /// Every vote cast so far, in arrival order.
    pub votes: Vec<VoteRecord>,
    /// Sum of all cast scores.
    pub total_score: Decimal,
    /// Whether every required evaluator has voted.
    pub finalized: bool,
    /// The decision law's verdict. Only meaningful once `finalized`.
    pub approved: Option<bool>,
}

/// Tunables for the decision law.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Mean-score cutoff for approval.
    pub approval_threshold: Decimal,
    /// Minimum number of evaluators whose individual score must clear the
    /// threshold.
    pub majority_required: usize,
    /// Evaluator count a grant needs before its result can be finalized.
    pub required_evaluator_count: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            approval_threshold: Decimal::from(50),
            majority_required: 3,
            required_evaluator_count: AgentType::evaluators().len(),
        }
    }
}

/// Errors the Data Store's operations can return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `UpdateGrantStatus` was asked for a transition the lifecycle diagram
    /// forbids.
    #[error("illegal transition for grant {grant_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// The grant whose transition was rejected.
        grant_id: GrantId,
        /// The status it was in.
        from: GrantStatus,
        /// The status that was requested.
        to: GrantStatus,
    },

    /// `AddEvaluation` was called twice for the same `(grant_id, agent_type)`.
    #[error("duplicate evaluation for grant {grant_id} from {agent_type}")]
    DuplicateEvaluation {
        /// The grant already evaluated.
        grant_id: GrantId,
        /// The evaluator that already voted.
        agent_type: AgentType,
    },

    /// No grant exists with the given id.
    #[error("unknown grant: {0}")]
    UnknownGrant(GrantId),
}

fn allowed_transition(from: GrantStatus, to: GrantStatus) -> bool {
    matches!(
        (from, to),
        (GrantStatus::Pending, GrantStatus::UnderReview)
            | (GrantStatus::Pending, GrantStatus::Rejected)
            | (GrantStatus::UnderReview, GrantStatus::Approved)
            | (GrantStatus::UnderReview, GrantStatus::Rejected)
            | (GrantStatus::Approved, GrantStatus::Completed)
    )
}

/// In-memory grants and evaluations table.
pub struct DataStore {
    grants: DashMap<GrantId, Grant>,
    evaluations: DashMap<GrantId, Vec<Evaluation>>,
    decision: DecisionConfig,
    time: SharedTimeProvider,
    bridge: Option<ExternalDbBridge>,
}

impl DataStore {
    /// Creates an empty store. `bridge` is `None` when no external database
    /// is configured.
    #[must_use]
    pub fn new(decision: DecisionConfig, time: SharedTimeProvider, bridge: Option<ExternalDbBridge>) -> Self {
        Self {
            grants: DashMap::new(),
            evaluations: DashMap::new(),
            decision,
            time,
            bridge,
        }
    }

    /// Creates a grant, honoring a caller-supplied id if present.
    #[instrument(skip(self, new_grant), fields(applicant = %new_grant.applicant))]
    pub fn create_grant(&self, new_grant: NewGrant) -> Grant {
        let id = new_grant.id.unwrap_or_else(GrantId::next);
        let grant = Grant {
            id,
            applicant: new_grant.applicant,
            ipfs_hash: new_grant.ipfs_hash,
            project_name: new_grant.project_name,
            description: new_grant.description,
            amount: new_grant.amount,
            status: GrantStatus::Pending,
            created_at: self.time.now(),
            updated_at: None,
        };
        self.grants.insert(id, grant.clone());
        grant
    }

    /// Looks a grant up by id.
    #[must_use]
    pub fn get_grant(&self, id: GrantId) -> Option<Grant> {
        self.grants.get(&id).map(|entry| entry.value().clone())
    }

    /// Transitions a grant's status, enforcing the lifecycle diagram, then
    /// asynchronously mirrors the change to the external database if one is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownGrant`] if `id` does not exist, or
    /// [`StoreError::IllegalTransition`] if the lifecycle diagram forbids the
    /// requested move.
    pub async fn update_grant_status(&self, id: GrantId, status: GrantStatus) -> Result<Grant, StoreError> {
        let updated = {
            let mut entry = self.grants.get_mut(&id).ok_or(StoreError::UnknownGrant(id))?;
            if !allowed_transition(entry.status, status) {
                return Err(StoreError::IllegalTransition {
                    grant_id: id,
                    from: entry.status,
                    to: status,
                });
            }
            entry.status = status;
            entry.updated_at = Some(self.time.now());
            entry.clone()
        };

        if let Some(bridge) = &self.bridge {
            bridge.mirror_status(id, status).await;
        }

        Ok(updated)
    }

    /// Records an evaluation. Duplicates for the same `(grant_id, agent_type)`
    /// are rejected rather than silently ignored — the Workflow Engine is
    /// responsible for downgrading that into a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownGrant`] if `grant_id` does not exist, or
    /// [`StoreError::DuplicateEvaluation`] if `agent_type` already voted.
    pub fn add_evaluation(
        &self,
        grant_id: GrantId,
        agent_type: AgentType,
        score: Score,
        reasoning: String,
        confidence: Confidence,
        concerns: Vec<String>,
        recommendations: Vec<String>,
    ) -> Result<Evaluation, StoreError> {
        if !self.grants.contains_key(&grant_id) {
            return Err(StoreError::UnknownGrant(grant_id));
        }
        let mut evaluations = self.evaluations.entry(grant_id).or_default();
        if evaluations.iter().any(|e| e.agent_type == agent_type) {
            return Err(StoreError::DuplicateEvaluation { grant_id, agent_type });
        }
        let evaluation = Evaluation {
            id: EvaluationId::generate(),
            grant_id,
            agent_type,
            score,
            reasoning,
            confidence,
            concerns,
            recommendations,
            created_at: self.time.now(),
        };
        evaluations.push(evaluation.clone());
        Ok(evaluation)
    }

    /// Returns every evaluation for a grant, oldest first.
    #[must_use]
    pub fn get_evaluations(&self, grant_id: GrantId) -> Vec<Evaluation> {
        self.evaluations
            .get(&grant_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Composes the current [`VotingResult`] for a grant under the
    /// configured decision law.
    #[must_use]
    pub fn calculate_voting_result(&self, grant_id: GrantId) -> VotingResult {
        let evaluations = self.get_evaluations(grant_id);
        let votes: Vec<VoteRecord> = evaluations
            .iter()
            .map(|e| VoteRecord {
                agent_type: e.agent_type,
                score: e.score,
                timestamp: e.created_at,
            })
            .collect();

        let total_score: Decimal = votes.iter().map(|v| v.score.into_inner()).sum();
        let finalized = votes.len() >= self.decision.required_evaluator_count;

        let approved = if votes.is_empty() {
            None
        } else {
            let mean = total_score / Decimal::from(votes.len());
            let above_threshold = votes
                .iter()
                .filter(|v| v.score.into_inner() >= self.decision.approval_threshold)
                .count();
            Some(mean >= self.decision.approval_threshold && above_threshold >= self.decision.majority_required)
        };

        VotingResult {
            grant_id,
            votes,
            total_score,
            finalized,
            approved,
        }
    }

    /// Filter scan over grants by status.
    #[must_use]
    pub fn get_grants_by_status(&self, status: GrantStatus) -> Vec<Grant> {
        self.grants
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Shared handle type used throughout the orchestrator.
pub type SharedDataStore = Arc<DataStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn new_grant(id: u64) -> NewGrant {
        NewGrant {
            id: Some(GrantId::try_from(id).unwrap()),
            applicant: "0x11...11".to_string(),
            ipfs_hash: "Qm...".to_string(),
            project_name: "Test Project".to_string(),
            description: "A test grant".to_string(),
            amount: GrantAmount::try_new(Decimal::from(50_000)).unwrap(),
        }
    }

    fn store() -> DataStore {
        DataStore::new(DecisionConfig::default(), test_time_provider(), None)
    }

    #[test]
    fn create_grant_assigns_pending_status() {
        let store = store();
        let grant = store.create_grant(new_grant(1));
        assert_eq!(grant.status, GrantStatus::Pending);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        let err = store.update_grant_status(id, GrantStatus::Approved).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn duplicate_evaluation_is_rejected() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        store
            .add_evaluation(
                id,
                AgentType::Technical,
                Score::from_f64(80.0).unwrap(),
                "solid".to_string(),
                Confidence::from_f64(0.9).unwrap(),
                vec![],
                vec![],
            )
            .unwrap();
        let err = store
            .add_evaluation(
                id,
                AgentType::Technical,
                Score::from_f64(20.0).unwrap(),
                "retry".to_string(),
                Confidence::from_f64(0.9).unwrap(),
                vec![],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvaluation { .. }));
    }

    fn vote(store: &DataStore, id: GrantId, agent_type: AgentType, score: f64) {
        store
            .add_evaluation(
                id,
                agent_type,
                Score::from_f64(score).unwrap(),
                "reasoning".to_string(),
                Confidence::from_f64(0.9).unwrap(),
                vec![],
                vec![],
            )
            .unwrap();
    }

    #[test]
    fn seed_scenario_s1_happy_path_approval() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        vote(&store, id, AgentType::Technical, 80.0);
        vote(&store, id, AgentType::Impact, 75.0);
        vote(&store, id, AgentType::DueDiligence, 70.0);
        vote(&store, id, AgentType::Budget, 60.0);
        vote(&store, id, AgentType::Community, 55.0);

        let result = store.calculate_voting_result(id);
        assert!(result.finalized);
        assert_eq!(result.approved, Some(true));
    }

    #[test]
    fn seed_scenario_s2_majority_failure() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        vote(&store, id, AgentType::Technical, 90.0);
        vote(&store, id, AgentType::Impact, 85.0);
        vote(&store, id, AgentType::DueDiligence, 40.0);
        vote(&store, id, AgentType::Budget, 30.0);
        vote(&store, id, AgentType::Community, 20.0);

        let result = store.calculate_voting_result(id);
        assert_eq!(result.approved, Some(false));
    }

    #[test]
    fn seed_scenario_s3_mean_failure() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        vote(&store, id, AgentType::Technical, 49.0);
        vote(&store, id, AgentType::Impact, 50.0);
        vote(&store, id, AgentType::DueDiligence, 50.0);
        vote(&store, id, AgentType::Budget, 50.0);
        vote(&store, id, AgentType::Community, 50.0);

        let result = store.calculate_voting_result(id);
        assert_eq!(result.approved, Some(false));
    }

    #[test]
    fn voting_result_is_not_finalized_with_partial_votes() {
        let store = store();
        store.create_grant(new_grant(1));
        let id = GrantId::try_from(1u64).unwrap();
        vote(&store, id, AgentType::Technical, 80.0);
        vote(&store, id, AgentType::Impact, 80.0);

        let result = store.calculate_voting_result(id);
        assert!(!result.finalized);
    }
}
