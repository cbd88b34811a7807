//! Orchestrator: the composition root.
//!
//! Boots the Agent Registry, Message Router, Message Bus, Data Store, and
//! Workflow Engine behind one handle, wires the Bus's vote-cast topic back
//! into the Workflow Engine, and runs the health and milestone loops.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agent::AgentType;
use crate::domain_types::{AgentInstanceId, GrantId};
use crate::error::OrchestratorError;
use crate::message::bus::SharedMessageBus;
use crate::message::router::MessageRouter;
use crate::message::types::{GrantSummary, Message, MessagePayload, MessageType, Priority, Recipient};
use crate::message::{BusConfig, MessageBus, SendOptions};
use crate::observability::{Event, EventBus};
use crate::registry::{AgentRegistry, RegistryError, SharedAgentRegistry};
use crate::store::bridge::{BridgeConfig, ExternalDbBridge};
use crate::store::{DataStore, DecisionConfig, Grant, GrantStatus, NewGrant, SharedDataStore};
use crate::time_provider::SharedTimeProvider;
use crate::workflow::{SharedWorkflowEngine, VoteCastInput, WorkflowConfig, WorkflowEngine, WorkflowStatus};

/// Tunables for the whole orchestration core.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a workflow waits for evaluators before forcing `failed`.
    pub evaluation_timeout: Duration,
    /// When true, evaluation requests fan out in one `Many` dispatch; when
    /// false, they go out one at a time, awaited in sequence.
    pub parallel_evaluations: bool,
    /// Approval threshold, majority requirement, and evaluator quorum size.
    pub decision: DecisionConfig,
    /// How often the health loop runs.
    pub health_check_interval: Duration,
    /// Whether the health loop actively probes registry liveness instead of
    /// only refreshing timestamps. Off by default so a run with no real
    /// agent connections doesn't mark everything unhealthy.
    pub active_health_probing: bool,
    /// How often the milestone loop scans approved grants.
    pub milestone_check_interval: Duration,
    /// Default retry budget forwarded to the Message Bus.
    pub max_retries: u32,
    /// Base URL of the external database bridge, if configured.
    pub python_services_url: Option<String>,
    /// Auth key for the external database bridge, if configured.
    pub python_api_key: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            evaluation_timeout: Duration::from_secs(300),
            parallel_evaluations: true,
            decision: DecisionConfig::default(),
            health_check_interval: Duration::from_secs(30),
            active_health_probing: false,
            milestone_check_interval: Duration::from_secs(3600),
            max_retries: 3,
            python_services_url: None,
            python_api_key: None,
        }
    }
}

/// Liveness classification the health loop assigns an agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Reachable, no recent failures.
    Healthy,
    /// At least one failed probe, under the unhealthy threshold.
    Degraded,
    /// At or past `consecutive_failures >= 3`.
    Unhealthy,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// One agent type's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// The agent type this record describes.
    pub agent_type: AgentType,
    /// Current classification.
    pub status: HealthStatus,
    /// When this record was last refreshed.
    pub last_check: std::time::SystemTime,
    /// Consecutive failed probes since the last success.
    pub consecutive_failures: u32,
    /// The most recent probe failure, if any.
    pub last_error: Option<String>,
}

/// Aggregate system health: the worst status of any tracked agent, plus a
/// human-readable issues list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Worst status across all tracked agent types.
    pub overall: HealthStatus,
    /// One line per agent type not currently healthy.
    pub issues: Vec<String>,
}

/// A snapshot of orchestrator-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Grants submitted through `process_new_grant`.
    pub grants_processed: u64,
    /// Grants whose workflow completed with an `approved` decision.
    pub grants_approved: u64,
    /// Grants whose workflow completed with a `rejected` decision.
    pub grants_rejected: u64,
    /// Running average of submission-to-decision latency, in milliseconds.
    pub average_evaluation_time_ms: f64,
    /// Workflows not yet in a terminal stage.
    pub active_workflows: usize,
    /// Agent types currently healthy.
    pub agents_healthy: usize,
    /// Agent types currently unhealthy.
    pub agents_unhealthy: usize,
}

#[derive(Default)]
struct StatsInner {
    grants_processed: AtomicU64,
    grants_approved: AtomicU64,
    grants_rejected: AtomicU64,
    evaluation_time_total_ms: AtomicU64,
    evaluations_completed: AtomicU64,
}

/// Builds the [`GrantSummary`] sent over the wire from a persisted [`Grant`].
fn grant_summary(grant: &Grant) -> GrantSummary {
    GrantSummary {
        grant_id: grant.id,
        applicant: grant.applicant.clone(),
        ipfs_hash: grant.ipfs_hash.clone(),
        project_name: grant.project_name.clone(),
        description: grant.description.clone(),
        amount: grant.amount,
    }
}

/// The top-level composition root. Boots one instance per [`AgentType`],
/// owns the Workflow Engine, and runs the health and milestone loops.
pub struct Orchestrator {
    config: OrchestratorConfig,
    time: SharedTimeProvider,
    events: EventBus,
    registry: SharedAgentRegistry,
    bus: SharedMessageBus,
    store: SharedDataStore,
    workflow: SharedWorkflowEngine,
    health: DashMap<AgentType, AgentHealth>,
    stats: StatsInner,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wires every component over the given configuration and time source.
    #[must_use]
    pub fn new(config: OrchestratorConfig, time: SharedTimeProvider) -> Arc<Self> {
        let events = EventBus::new();
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&time)));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), Arc::clone(&time)));
        let bus_config = BusConfig {
            default_max_retries: config.max_retries,
            ..BusConfig::default()
        };
        let bus = MessageBus::new(bus_config, router, Arc::clone(&registry), Arc::clone(&time), events.clone());
        let bridge = config.python_services_url.clone().map(|base_url| {
            ExternalDbBridge::new(BridgeConfig {
                base_url,
                api_key: config.python_api_key.clone(),
            })
        });
        let store = Arc::new(DataStore::new(config.decision.clone(), Arc::clone(&time), bridge));
        let workflow = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            events.clone(),
            Arc::clone(&time),
            WorkflowConfig {
                evaluation_timeout: config.evaluation_timeout,
            },
        );

        Arc::new(Self {
            config,
            time,
            events,
            registry,
            bus,
            store,
            workflow,
            health: DashMap::new(),
            stats: StatsInner::default(),
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            loop_handles: Mutex::new(Vec::new()),
        })
    }

    /// Registers one instance per agent type, wires the vote-cast listener,
    /// and starts the Bus, health, and milestone loops. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Registry`] if an agent-type instance id
    /// collides with an existing registration for a reason other than it
    /// already being this orchestrator's own prior registration.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for agent_type in AgentType::all() {
            let id = AgentInstanceId::try_new(format!("{agent_type}-1"))
                .map_err(|err| OrchestratorError::Validation(err.to_string()))?;
            match self.registry.register(id, agent_type) {
                Ok(_) | Err(RegistryError::DuplicateAgent(_)) => {}
                Err(err) => return Err(OrchestratorError::Registry(err)),
            }
            self.health.insert(
                agent_type,
                AgentHealth {
                    agent_type,
                    status: HealthStatus::Healthy,
                    last_check: self.time.now(),
                    consecutive_failures: 0,
                    last_error: None,
                },
            );
        }

        let listener_id = AgentInstanceId::try_new("coordinator-vote-listener".to_string())
            .expect("static id is within AgentInstanceId bounds");
        let vote_rx = self.bus.subscribe_to_event(listener_id, MessageType::VoteCast);

        let mut handles = Vec::new();
        handles.push(self.spawn_vote_listener(vote_rx));
        handles.push(self.spawn_completion_listener());
        handles.push(self.spawn_health_loop());
        handles.push(self.spawn_milestone_loop());
        let (processing, discovery) = self.bus.spawn_loops();
        handles.push(processing);
        handles.push(discovery);

        self.loop_handles.lock().await.extend(handles);

        self.events.emit(Event::OrchestratorStarted);
        info!("orchestrator started");
        Ok(())
    }

    /// Stops the periodic loops and the Bus, waits up to 30 seconds for
    /// active workflows to reach a terminal stage, then unregisters every
    /// agent. Idempotent.
    #[instrument(skip(self))]
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.bus.shutdown();

        let deadline = self.time.now() + Duration::from_secs(30);
        while !self.workflow.active_workflows().is_empty() && self.time.now() < deadline {
            self.time.sleep(Duration::from_millis(50)).await;
        }

        for info in self.registry.snapshot() {
            let _ = self.registry.unregister(&info.id);
        }

        for handle in self.loop_handles.lock().await.drain(..) {
            handle.abort();
        }

        self.events.emit(Event::OrchestratorShutdown);
        info!("orchestrator shut down");
    }

    /// Creates the grant, starts its workflow, dispatches the intake
    /// notification, and fans evaluation requests out to the evaluator
    /// agent types. Returns the assigned grant id.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Workflow`] if a workflow already exists
    /// for the assigned id, or [`OrchestratorError::Bus`] if the queue is
    /// full while dispatching the intake or evaluation-request messages.
    #[instrument(skip(self, new_grant))]
    pub async fn process_new_grant(self: &Arc<Self>, new_grant: NewGrant) -> Result<GrantId, OrchestratorError> {
        let grant = self.store.create_grant(new_grant);
        self.workflow.start(grant.id)?;
        let summary = grant_summary(&grant);

        self.bus
            .send(
                AgentType::Coordinator,
                Recipient::One(AgentType::Intake),
                MessagePayload::NewGrant {
                    grant_id: grant.id,
                    grant_data: summary.clone(),
                },
                SendOptions {
                    priority: Priority::High,
                    max_retries: None,
                },
            )
            .await?;

        if self.config.parallel_evaluations {
            self.bus
                .request_evaluation(AgentType::Coordinator, grant.id, summary, self.config.evaluation_timeout)
                .await?;
        } else {
            for evaluator in AgentType::evaluators() {
                self.bus
                    .send(
                        AgentType::Coordinator,
                        Recipient::One(evaluator),
                        MessagePayload::EvaluationRequest {
                            grant_id: grant.id,
                            grant_data: summary.clone(),
                            requested_at: self.time.now(),
                            timeout: self.config.evaluation_timeout,
                        },
                        SendOptions {
                            priority: Priority::High,
                            max_retries: None,
                        },
                    )
                    .await?;
            }
        }

        self.stats.grants_processed.fetch_add(1, Ordering::Relaxed);
        Ok(grant.id)
    }

    /// Looks a workflow up by grant id.
    #[must_use]
    pub fn get_workflow_status(&self, grant_id: GrantId) -> Option<WorkflowStatus> {
        self.workflow.get(grant_id)
    }

    /// Every workflow not yet in a terminal stage.
    #[must_use]
    pub fn get_active_workflows(&self) -> Vec<WorkflowStatus> {
        self.workflow.active_workflows()
    }

    /// Health for one agent type, or every tracked type when `None`.
    #[must_use]
    pub fn get_agent_health(&self, agent_type: Option<AgentType>) -> Vec<AgentHealth> {
        match agent_type {
            Some(t) => self.health.get(&t).map(|e| e.value().clone()).into_iter().collect(),
            None => self.health.iter().map(|e| e.value().clone()).collect(),
        }
    }

    /// Aggregate health: the worst status of any tracked agent, plus an
    /// issue line per agent type that isn't healthy.
    #[must_use]
    pub fn get_system_health(&self) -> SystemHealth {
        let mut overall = HealthStatus::Healthy;
        let mut issues = Vec::new();
        for entry in &self.health {
            let health = entry.value();
            if health.status.rank() > overall.rank() {
                overall = health.status;
            }
            if health.status != HealthStatus::Healthy {
                issues.push(format!("{}: {:?}", health.agent_type, health.status));
            }
        }
        SystemHealth { overall, issues }
    }

    /// A snapshot of orchestrator-level statistics.
    #[must_use]
    pub fn get_stats(&self) -> OrchestratorStats {
        let completed = self.stats.evaluations_completed.load(Ordering::Relaxed);
        let total_ms = self.stats.evaluation_time_total_ms.load(Ordering::Relaxed);
        let average_evaluation_time_ms = if completed == 0 { 0.0 } else { total_ms as f64 / completed as f64 };
        OrchestratorStats {
            grants_processed: self.stats.grants_processed.load(Ordering::Relaxed),
            grants_approved: self.stats.grants_approved.load(Ordering::Relaxed),
            grants_rejected: self.stats.grants_rejected.load(Ordering::Relaxed),
            average_evaluation_time_ms,
            active_workflows: self.workflow.active_workflows().len(),
            agents_healthy: self
                .health
                .iter()
                .filter(|e| e.value().status == HealthStatus::Healthy)
                .count(),
            agents_unhealthy: self
                .health
                .iter()
                .filter(|e| e.value().status == HealthStatus::Unhealthy)
                .count(),
        }
    }

    fn spawn_vote_listener(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.notified() => break,
                    received = rx.recv() => {
                        match received {
                            Some(message) => orchestrator.ingest_vote_message(message).await,
                            None => break,
                        }
                    }
                }
            }
        })
    }

    async fn ingest_vote_message(&self, message: Message) {
        let MessagePayload::VoteCast {
            grant_id,
            score,
            reasoning,
            confidence,
            concerns,
            recommendations,
        } = message.payload
        else {
            return;
        };
        let vote = VoteCastInput {
            score,
            reasoning,
            confidence,
            concerns,
            recommendations,
        };
        if let Err(err) = self.workflow.handle_vote_cast(grant_id, message.from, vote).await {
            warn!(%grant_id, error = %err, "failed to record vote");
        }
    }

    fn spawn_completion_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let mut events_rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.notified() => break,
                    received = events_rx.recv() => {
                        match received {
                            Ok(Event::WorkflowComplete { grant_id }) => orchestrator.record_completion(grant_id),
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    fn record_completion(&self, grant_id: GrantId) {
        let Some(status) = self.workflow.get(grant_id) else { return };
        let Some(grant) = self.store.get_grant(grant_id) else { return };

        let elapsed_ms = status
            .updated_at
            .duration_since(status.started_at)
            .unwrap_or_default()
            .as_millis() as u64;
        self.stats.evaluation_time_total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.stats.evaluations_completed.fetch_add(1, Ordering::Relaxed);

        match grant.status {
            GrantStatus::Approved => {
                self.stats.grants_approved.fetch_add(1, Ordering::Relaxed);
            }
            GrantStatus::Rejected => {
                self.stats.grants_rejected.fetch_add(1, Ordering::Relaxed);
            }
            GrantStatus::Pending | GrantStatus::UnderReview | GrantStatus::Completed => {}
        }
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.health_check_interval;
        let time = Arc::clone(&self.time);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.notified() => break,
                    () = time.sleep(interval) => orchestrator.run_health_check().await,
                }
            }
        })
    }

    async fn run_health_check(&self) {
        let now = self.time.now();
        let mut to_recover = Vec::new();
        for mut entry in self.health.iter_mut() {
            entry.last_check = now;
            if !self.config.active_health_probing {
                continue;
            }
            if self.registry.has_active(entry.agent_type) {
                entry.consecutive_failures = 0;
                entry.status = HealthStatus::Healthy;
                entry.last_error = None;
            } else {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= 3 {
                    entry.status = HealthStatus::Unhealthy;
                    entry.last_error = Some("no active registered instance".to_string());
                    to_recover.push(entry.agent_type);
                } else {
                    entry.status = HealthStatus::Degraded;
                }
            }
        }
        for agent_type in to_recover {
            self.events.emit(Event::HealthDegraded { agent_type });
            self.attempt_recovery(agent_type).await;
        }
    }

    async fn attempt_recovery(&self, agent_type: AgentType) {
        let Ok(fresh_id) = AgentInstanceId::try_new(format!("{agent_type}-recovered-{}", Uuid::new_v4())) else {
            return;
        };
        match self.registry.register(fresh_id, agent_type) {
            Ok(_) => {
                if let Some(mut health) = self.health.get_mut(&agent_type) {
                    health.status = HealthStatus::Healthy;
                    health.consecutive_failures = 0;
                    health.last_error = None;
                }
                self.events.emit(Event::AgentRecovered { agent_type });
            }
            Err(err) => {
                self.events.emit(Event::AgentRecoveryFailed {
                    agent_type,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn spawn_milestone_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.milestone_check_interval;
        let time = Arc::clone(&self.time);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.notified() => break,
                    () = time.sleep(interval) => orchestrator.run_milestone_check().await,
                }
            }
        })
    }

    async fn run_milestone_check(&self) {
        for grant in self.store.get_grants_by_status(GrantStatus::Approved) {
            let send_result = self
                .bus
                .send(
                    AgentType::Coordinator,
                    Recipient::One(AgentType::Executor),
                    MessagePayload::SystemStatus {
                        detail: format!("milestone-check:grant={}", grant.id),
                    },
                    SendOptions {
                        priority: Priority::Normal,
                        max_retries: None,
                    },
                )
                .await;
            if let Err(err) = send_result {
                warn!(grant_id = %grant.id, error = %err, "failed to dispatch milestone check");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::GrantAmount;
    use crate::time_provider::test_time_provider;
    use rust_decimal::Decimal;

    fn submission() -> NewGrant {
        NewGrant {
            id: None,
            applicant: "0x11...11".to_string(),
            ipfs_hash: "Qm...".to_string(),
            project_name: "Test Project".to_string(),
            description: "A test grant".to_string(),
            amount: GrantAmount::try_new(Decimal::from(50_000)).unwrap(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_registers_every_agent_type() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), test_time_provider());
        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.get_agent_health(None).len(), AgentType::all().len());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn process_new_grant_creates_a_workflow() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), test_time_provider());
        orchestrator.start().await.unwrap();
        let grant_id = orchestrator.process_new_grant(submission()).await.unwrap();
        let status = orchestrator.get_workflow_status(grant_id).unwrap();
        assert_eq!(status.grant_id, grant_id);
        assert_eq!(orchestrator.get_stats().grants_processed, 1);
        orchestrator.shutdown().await;
    }

    #[test]
    fn system_health_starts_empty_before_start() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), test_time_provider());
        let health = orchestrator.get_system_health();
        assert_eq!(health.overall, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }
}
