//! Workflow Engine
//!
//! Owns the per-grant state machine driving a submission from intake through
//! evaluation, voting, decision, and execution.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::agent::AgentType;
use crate::domain_types::{Confidence, GrantId, Score};
use crate::message::bus::SharedMessageBus;
use crate::message::types::{Decision, MessagePayload, Priority, Recipient};
use crate::message::SendOptions;
use crate::observability::{Event, EventBus};
use crate::store::{GrantStatus, SharedDataStore, StoreError};
use crate::time_provider::SharedTimeProvider;

/// A workflow's position in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Workflow created, intake notification dispatched.
    Submission,
    /// Evaluation requests dispatched; awaiting votes.
    Evaluation,
    /// All required evaluators have voted; aggregation running.
    Voting,
    /// Vote result computed; approval or rejection chosen.
    Decision,
    /// Decision messages dispatched.
    Execution,
    /// Terminal successful state.
    Complete,
    /// Terminal failure state.
    Failed,
}

impl WorkflowStage {
    #[cfg_attr(not(test), allow(dead_code))]
    fn rank(self) -> u8 {
        match self {
            WorkflowStage::Submission => 0,
            WorkflowStage::Evaluation => 1,
            WorkflowStage::Voting => 2,
            WorkflowStage::Decision => 3,
            WorkflowStage::Execution => 4,
            WorkflowStage::Complete => 5,
            WorkflowStage::Failed => 6,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, WorkflowStage::Complete | WorkflowStage::Failed)
    }
}

/// The live state of one grant's workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// The grant this workflow tracks.
    pub grant_id: GrantId,
    /// Current stage.
    pub stage: WorkflowStage,
    /// Overall completion estimate, `[0, 100]`.
    pub progress: u8,
    /// Evaluator types that have voted.
    pub evaluations_complete: HashSet<AgentType>,
    /// Evaluator types still awaited.
    pub evaluations_pending: HashSet<AgentType>,
    /// When the workflow was created.
    pub started_at: SystemTime,
    /// When the workflow last changed.
    pub updated_at: SystemTime,
    /// Set once the workflow enters `failed`.
    pub error: Option<String>,
}

/// Errors the Workflow Engine's operations can return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// `start` was called twice for the same grant.
    #[error("workflow already exists for grant {0}")]
    AlreadyExists(GrantId),

    /// No workflow is tracked for the requested grant id.
    #[error("no workflow for grant {0}")]
    NotFound(GrantId),

    /// Aggregation or decision raised an unexpected error.
    #[error("workflow aggregation failed for grant {grant_id}: {reason}")]
    AggregationFailed {
        /// The grant whose aggregation failed.
        grant_id: GrantId,
        /// What went wrong.
        reason: String,
    },
}

/// The fields of an evaluator's `vote_cast` message relevant to the engine,
/// bundled so [`WorkflowEngine::handle_vote_cast`] takes one payload instead
/// of a long parameter list.
#[derive(Debug, Clone)]
pub struct VoteCastInput {
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
}

/// Tunables the engine needs from [`crate::orchestrator::OrchestratorConfig`].
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// How long a workflow waits in `evaluation` before forcing `failed`.
    pub evaluation_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            evaluation_timeout: Duration::from_secs(300),
        }
    }
}

/// Owns every live grant's workflow state machine.
pub struct WorkflowEngine {
    store: SharedDataStore,
    bus: SharedMessageBus,
    events: EventBus,
    time: SharedTimeProvider,
    config: WorkflowConfig,
    workflows: DashMap<GrantId, WorkflowStatus>,
    timeout_cancel: DashMap<GrantId, Arc<Notify>>,
}

impl WorkflowEngine {
    /// Builds an engine over the given store and bus.
    #[must_use]
    pub fn new(
        store: SharedDataStore,
        bus: SharedMessageBus,
        events: EventBus,
        time: SharedTimeProvider,
        config: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            events,
            time,
            config,
            workflows: DashMap::new(),
            timeout_cancel: DashMap::new(),
        })
    }

    fn required_evaluators() -> HashSet<AgentType> {
        AgentType::evaluators().into_iter().collect()
    }

    /// Creates a workflow in `submission` and immediately advances it to
    /// `evaluation`, arming the timeout watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::AlreadyExists`] if a workflow for this grant
    /// is already tracked.
    pub fn start(self: &Arc<Self>, grant_id: GrantId) -> Result<WorkflowStatus, WorkflowError> {
        if self.workflows.contains_key(&grant_id) {
            return Err(WorkflowError::AlreadyExists(grant_id));
        }
        let now = self.time.now();
        let required = Self::required_evaluators();
        let status = WorkflowStatus {
            grant_id,
            stage: WorkflowStage::Submission,
            progress: 10,
            evaluations_complete: HashSet::new(),
            evaluations_pending: required,
            started_at: now,
            updated_at: now,
            error: None,
        };
        self.workflows.insert(grant_id, status.clone());
        self.events.emit(Event::WorkflowStarted { grant_id });
        self.events.emit(Event::WorkflowStageChanged {
            grant_id,
            stage: WorkflowStage::Submission,
        });

        self.advance_to_evaluation(grant_id);
        self.arm_timeout(grant_id);

        Ok(self.workflows.get(&grant_id).map(|e| e.value().clone()).unwrap_or(status))
    }

    fn advance_to_evaluation(&self, grant_id: GrantId) {
        if let Some(mut entry) = self.workflows.get_mut(&grant_id) {
            entry.stage = WorkflowStage::Evaluation;
            entry.progress = 20;
            entry.updated_at = self.time.now();
        }
        self.events.emit(Event::WorkflowStageChanged {
            grant_id,
            stage: WorkflowStage::Evaluation,
        });
    }

    fn arm_timeout(self: &Arc<Self>, grant_id: GrantId) {
        let notify = Arc::new(Notify::new());
        self.timeout_cancel.insert(grant_id, Arc::clone(&notify));
        let engine = Arc::clone(self);
        let timeout = self.config.evaluation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = notify.notified() => {}
                () = engine.time.sleep(timeout) => {
                    engine.fire_timeout(grant_id);
                }
            }
        });
    }

    fn disarm_timeout(&self, grant_id: GrantId) {
        if let Some((_, notify)) = self.timeout_cancel.remove(&grant_id) {
            notify.notify_waiters();
        }
    }

    fn fire_timeout(&self, grant_id: GrantId) {
        let Some(mut entry) = self.workflows.get_mut(&grant_id) else {
            return;
        };
        if entry.stage != WorkflowStage::Evaluation || entry.evaluations_pending.is_empty() {
            return;
        }
        let missing: Vec<AgentType> = entry.evaluations_pending.iter().copied().collect();
        entry.stage = WorkflowStage::Failed;
        entry.error = Some(format!(
            "timeout; missing: {}",
            missing.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ));
        entry.updated_at = self.time.now();
        drop(entry);

        self.events.emit(Event::EvaluationTimeout {
            grant_id,
            missing: missing.clone(),
        });
        self.events.emit(Event::WorkflowFailed {
            grant_id,
            reason: format!("evaluation timeout, missing: {missing:?}"),
        });
        warn!(%grant_id, ?missing, "workflow timed out awaiting evaluations");
    }

    /// Looks a workflow up by grant id.
    #[must_use]
    pub fn get(&self, grant_id: GrantId) -> Option<WorkflowStatus> {
        self.workflows.get(&grant_id).map(|e| e.value().clone())
    }

    /// Every workflow not yet in a terminal stage.
    #[must_use]
    pub fn active_workflows(&self) -> Vec<WorkflowStatus> {
        self.workflows
            .iter()
            .filter(|e| !e.value().stage.is_terminal())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Every tracked workflow, terminal or not.
    #[must_use]
    pub fn all_workflows(&self) -> Vec<WorkflowStatus> {
        self.workflows.iter().map(|e| e.value().clone()).collect()
    }

    /// Handles a delivered `vote_cast` message: persists the evaluation,
    /// advances progress, and — once every required evaluator has voted —
    /// runs aggregation through to a decision.
    ///
    /// Duplicate votes for an `(grant_id, agent_type)` pair are logged and
    /// otherwise ignored, satisfying the duplicate-idempotence property.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::NotFound`] if no workflow tracks `grant_id`.
    #[instrument(skip(self, vote))]
    pub async fn handle_vote_cast(
        &self,
        grant_id: GrantId,
        agent_type: AgentType,
        vote: VoteCastInput,
    ) -> Result<(), WorkflowError> {
        if self.get(grant_id).is_none() {
            return Err(WorkflowError::NotFound(grant_id));
        }

        match self.store.add_evaluation(
            grant_id,
            agent_type,
            vote.score,
            vote.reasoning,
            vote.confidence,
            vote.concerns,
            vote.recommendations,
        ) {
            Ok(_) => {}
            Err(StoreError::DuplicateEvaluation { .. }) => {
                warn!(%grant_id, %agent_type, "duplicate vote ignored");
                return Ok(());
            }
            Err(err) => {
                return Err(WorkflowError::AggregationFailed {
                    grant_id,
                    reason: err.to_string(),
                });
            }
        }

        let pending_empty = {
            let Some(mut entry) = self.workflows.get_mut(&grant_id) else {
                return Err(WorkflowError::NotFound(grant_id));
            };
            if entry.stage != WorkflowStage::Evaluation {
                return Ok(());
            }
            entry.evaluations_pending.remove(&agent_type);
            entry.evaluations_complete.insert(agent_type);
            let required = Self::required_evaluators().len().max(1) as f64;
            let complete = entry.evaluations_complete.len() as f64;
            entry.progress = 20 + ((complete / required) * 50.0).round() as u8;
            entry.updated_at = self.time.now();
            entry.evaluations_pending.is_empty()
        };

        self.events.emit(Event::EvaluationProgress {
            grant_id,
            progress: self.get(grant_id).map(|s| s.progress).unwrap_or(0),
        });

        if pending_empty {
            self.disarm_timeout(grant_id);
            self.run_voting_and_decision(grant_id).await;
        }

        Ok(())
    }

    async fn run_voting_and_decision(&self, grant_id: GrantId) {
        self.set_stage(grant_id, WorkflowStage::Voting, 70);
        if let Err(err) = self.store.update_grant_status(grant_id, GrantStatus::UnderReview).await {
            self.fail(grant_id, err.to_string());
            return;
        }

        let voting_result = self.store.calculate_voting_result(grant_id);
        if !voting_result.finalized {
            self.fail(grant_id, "aggregation ran with an incomplete vote set".to_string());
            return;
        }
        let approved = voting_result.approved.unwrap_or(false);

        self.set_stage(grant_id, WorkflowStage::Decision, 80);
        let new_status = if approved { GrantStatus::Approved } else { GrantStatus::Rejected };
        if let Err(err) = self.store.update_grant_status(grant_id, new_status).await {
            self.fail(grant_id, err.to_string());
            return;
        }

        let decision = if approved { Decision::Approved } else { Decision::Rejected };
        let send_result = self
            .bus
            .send(
                AgentType::Coordinator,
                Recipient::One(AgentType::Executor),
                MessagePayload::ApprovalDecision {
                    grant_id,
                    decision,
                    voting_result,
                },
                SendOptions {
                    priority: Priority::High,
                    max_retries: None,
                },
            )
            .await;
        if let Err(err) = send_result {
            warn!(%grant_id, error = %err, "failed to dispatch approval decision");
        }

        self.set_stage(grant_id, WorkflowStage::Execution, 90);
        self.set_stage(grant_id, WorkflowStage::Complete, 100);
        self.events.emit(Event::WorkflowComplete { grant_id });
        info!(%grant_id, approved, "workflow complete");
    }

    fn set_stage(&self, grant_id: GrantId, stage: WorkflowStage, progress: u8) {
        if let Some(mut entry) = self.workflows.get_mut(&grant_id) {
            entry.stage = stage;
            entry.progress = entry.progress.max(progress);
            entry.updated_at = self.time.now();
        }
        self.events.emit(Event::WorkflowStageChanged { grant_id, stage });
    }

    fn fail(&self, grant_id: GrantId, reason: String) {
        self.disarm_timeout(grant_id);
        if let Some(mut entry) = self.workflows.get_mut(&grant_id) {
            entry.stage = WorkflowStage::Failed;
            entry.error = Some(reason.clone());
            entry.updated_at = self.time.now();
        }
        self.events.emit(Event::WorkflowFailed { grant_id, reason });
    }
}

/// Shared handle type used throughout the orchestrator.
pub type SharedWorkflowEngine = Arc<WorkflowEngine>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::router::MessageRouter;
    use crate::message::MessageBus;
    use crate::registry::AgentRegistry;
    use crate::store::{DataStore, DecisionConfig, NewGrant};
    use crate::time_provider::test_time_provider;
    use crate::domain_types::GrantAmount;
    use rust_decimal::Decimal;

    fn engine_with_grant() -> (Arc<WorkflowEngine>, GrantId) {
        let registry = Arc::new(AgentRegistry::new(test_time_provider()));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), test_time_provider()));
        let bus = MessageBus::new(
            crate::message::BusConfig::default(),
            router,
            registry,
            test_time_provider(),
            EventBus::new(),
        );
        let store = Arc::new(DataStore::new(DecisionConfig::default(), test_time_provider(), None));
        let grant = store.create_grant(NewGrant {
            id: None,
            applicant: "0x11...11".to_string(),
            ipfs_hash: "Qm...".to_string(),
            project_name: "Test".to_string(),
            description: "Test grant".to_string(),
            amount: GrantAmount::try_new(Decimal::from(50_000)).unwrap(),
        });
        let engine = WorkflowEngine::new(
            store,
            bus,
            EventBus::new(),
            test_time_provider(),
            WorkflowConfig::default(),
        );
        engine.start(grant.id).unwrap();
        (engine, grant.id)
    }

    #[tokio::test]
    async fn seed_scenario_s1_reaches_complete_and_approves() {
        let (engine, grant_id) = engine_with_grant();
        for (agent_type, score) in [
            (AgentType::Technical, 80.0),
            (AgentType::Impact, 75.0),
            (AgentType::DueDiligence, 70.0),
            (AgentType::Budget, 60.0),
            (AgentType::Community, 55.0),
        ] {
            engine
                .handle_vote_cast(
                    grant_id,
                    agent_type,
                    VoteCastInput {
                        score: Score::from_f64(score).unwrap(),
                        reasoning: "reasoning".to_string(),
                        confidence: Confidence::from_f64(0.9).unwrap(),
                        concerns: vec![],
                        recommendations: vec![],
                    },
                )
                .await
                .unwrap();
        }
        let status = engine.get(grant_id).unwrap();
        assert_eq!(status.stage, WorkflowStage::Complete);
        assert_eq!(status.progress, 100);
    }

    #[tokio::test]
    async fn duplicate_vote_does_not_advance_workflow_twice() {
        let (engine, grant_id) = engine_with_grant();
        engine
            .handle_vote_cast(
                grant_id,
                AgentType::Technical,
                VoteCastInput {
                    score: Score::from_f64(80.0).unwrap(),
                    reasoning: "reasoning".to_string(),
                    confidence: Confidence::from_f64(0.9).unwrap(),
                    concerns: vec![],
                    recommendations: vec![],
                },
            )
            .await
            .unwrap();
        engine
            .handle_vote_cast(
                grant_id,
                AgentType::Technical,
                VoteCastInput {
                    score: Score::from_f64(10.0).unwrap(),
                    reasoning: "resend".to_string(),
                    confidence: Confidence::from_f64(0.9).unwrap(),
                    concerns: vec![],
                    recommendations: vec![],
                },
            )
            .await
            .unwrap();
        let status = engine.get(grant_id).unwrap();
        assert_eq!(status.evaluations_complete.len(), 1);
        assert_eq!(status.stage, WorkflowStage::Evaluation);
    }

    async fn cast_votes(engine: &Arc<WorkflowEngine>, grant_id: GrantId, votes: [(AgentType, f64); 5]) {
        for (agent_type, score) in votes {
            engine
                .handle_vote_cast(
                    grant_id,
                    agent_type,
                    VoteCastInput {
                        score: Score::from_f64(score).unwrap(),
                        reasoning: "reasoning".to_string(),
                        confidence: Confidence::from_f64(0.9).unwrap(),
                        concerns: vec![],
                        recommendations: vec![],
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn seed_scenario_s2_majority_failure_rejects() {
        let (engine, grant_id) = engine_with_grant();
        cast_votes(
            &engine,
            grant_id,
            [
                (AgentType::Technical, 90.0),
                (AgentType::Impact, 85.0),
                (AgentType::DueDiligence, 40.0),
                (AgentType::Budget, 30.0),
                (AgentType::Community, 20.0),
            ],
        )
        .await;
        let status = engine.get(grant_id).unwrap();
        assert_eq!(status.stage, WorkflowStage::Complete);
        assert_eq!(engine.store.get_grant(grant_id).unwrap().status, GrantStatus::Rejected);
    }

    #[tokio::test]
    async fn seed_scenario_s3_mean_failure_rejects() {
        let (engine, grant_id) = engine_with_grant();
        cast_votes(
            &engine,
            grant_id,
            [
                (AgentType::Technical, 49.0),
                (AgentType::Impact, 50.0),
                (AgentType::DueDiligence, 50.0),
                (AgentType::Budget, 50.0),
                (AgentType::Community, 50.0),
            ],
        )
        .await;
        let status = engine.get(grant_id).unwrap();
        assert_eq!(status.stage, WorkflowStage::Complete);
        assert_eq!(engine.store.get_grant(grant_id).unwrap().status, GrantStatus::Rejected);
    }

    #[tokio::test]
    async fn seed_scenario_s4_timeout_fails_with_missing_agents_listed() {
        let (engine, grant_id) = engine_with_grant();
        cast_votes(
            &engine,
            grant_id,
            [
                (AgentType::Technical, 80.0),
                (AgentType::Impact, 75.0),
                // three evaluators never vote
                (AgentType::Technical, 80.0),
                (AgentType::Technical, 80.0),
                (AgentType::Technical, 80.0),
            ],
        )
        .await;
        let before = engine.get(grant_id).unwrap();
        assert_eq!(before.evaluations_complete.len(), 2);
        assert_eq!(before.stage, WorkflowStage::Evaluation);

        engine.fire_timeout(grant_id);

        let after = engine.get(grant_id).unwrap();
        assert_eq!(after.stage, WorkflowStage::Failed);
        let error = after.error.expect("timeout sets an error");
        for missing in [AgentType::DueDiligence, AgentType::Budget, AgentType::Community] {
            assert!(error.contains(&missing.to_string()), "expected {error} to mention {missing}");
        }

        // firing again after the workflow left `evaluation` must be a no-op.
        engine.fire_timeout(grant_id);
        assert_eq!(engine.get(grant_id).unwrap().error, Some(error));
    }

    #[test]
    fn progress_never_decreases_across_stage_transitions() {
        let ranks = [
            WorkflowStage::Submission,
            WorkflowStage::Evaluation,
            WorkflowStage::Voting,
            WorkflowStage::Decision,
            WorkflowStage::Execution,
            WorkflowStage::Complete,
        ];
        for pair in ranks.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }
}
