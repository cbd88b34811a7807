//! Agent Registry
//!
//! Directory of agent instances keyed by id, typed, with status and
//! last-activity timestamps. Registration order is preserved per type so
//! `get_by_type` can offer a deterministic tie-break.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::agent::{AgentInfo, AgentStatus, AgentType};
use crate::domain_types::AgentInstanceId;
use crate::time_provider::SharedTimeProvider;

/// Errors the registry's operations can return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An active registration already exists under this id.
    #[error("agent already registered: {0}")]
    DuplicateAgent(AgentInstanceId),

    /// No registration exists for this id.
    #[error("agent not found: {0}")]
    NotFound(AgentInstanceId),
}

/// Directory of all known agent instances.
///
/// Reads and writes are serialized per-entry via `DashMap`; `get_by_type`
/// additionally tracks insertion order so callers see a stable ordering.
pub struct AgentRegistry {
    agents: DashMap<AgentInstanceId, AgentInfo>,
    by_type_order: DashMap<AgentType, Vec<AgentInstanceId>>,
    time: SharedTimeProvider,
}

impl AgentRegistry {
    /// Creates an empty registry driven by the given time source.
    #[must_use]
    pub fn new(time: SharedTimeProvider) -> Self {
        Self {
            agents: DashMap::new(),
            by_type_order: DashMap::new(),
            time,
        }
    }

    /// Registers a new agent instance.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateAgent`] if `id` is already active.
    #[instrument(skip(self))]
    pub fn register(
        &self,
        id: AgentInstanceId,
        agent_type: AgentType,
    ) -> Result<AgentInfo, RegistryError> {
        if self.agents.contains_key(&id) {
            return Err(RegistryError::DuplicateAgent(id));
        }
        let now = self.time.now();
        let info = AgentInfo::new(id.clone(), agent_type, now);
        self.agents.insert(id.clone(), info.clone());
        self.by_type_order.entry(agent_type).or_default().push(id);
        debug!(agent_type = %agent_type, "agent registered");
        Ok(info)
    }

    /// Removes a registration. Idempotent: an unknown id yields `NotFound`
    /// but is otherwise harmless to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` was never registered.
    pub fn unregister(&self, id: &AgentInstanceId) -> Result<(), RegistryError> {
        let Some((_, info)) = self.agents.remove(id) else {
            return Err(RegistryError::NotFound(id.clone()));
        };
        if let Some(mut order) = self.by_type_order.get_mut(&info.agent_type) {
            order.retain(|existing| existing != id);
        }
        Ok(())
    }

    /// Looks up a single agent by id.
    #[must_use]
    pub fn get(&self, id: &AgentInstanceId) -> Option<AgentInfo> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    /// Returns all agents of a type, in registration order.
    #[must_use]
    pub fn get_by_type(&self, agent_type: AgentType) -> Vec<AgentInfo> {
        let Some(order) = self.by_type_order.get(&agent_type) else {
            return Vec::new();
        };
        order
            .iter()
            .filter_map(|id| self.agents.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    /// Returns all agents currently in a given status.
    #[must_use]
    pub fn get_by_status(&self, status: AgentStatus) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Returns whether at least one agent of `agent_type` is currently active.
    #[must_use]
    pub fn has_active(&self, agent_type: AgentType) -> bool {
        self.get_by_type(agent_type)
            .iter()
            .any(|info| info.status == AgentStatus::Active)
    }

    /// Bumps `last_activity` without touching `status`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` is not registered.
    pub fn update_activity(&self, id: &AgentInstanceId) -> Result<(), RegistryError> {
        let mut entry = self.agents.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entry.last_activity = self.time.now();
        Ok(())
    }

    /// Sets an agent's status. No transition table is enforced at this layer;
    /// upstream callers (the health loop, the bus) decide what is legal.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` is not registered.
    pub fn set_status(&self, id: &AgentInstanceId, status: AgentStatus) -> Result<(), RegistryError> {
        let mut entry = self.agents.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entry.status = status;
        Ok(())
    }

    /// Increments the evaluation counter for an agent, ignoring unknown ids
    /// (a duplicate vote from a deregistered agent should not be fatal).
    pub fn record_evaluation(&self, id: &AgentInstanceId) {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.evaluations_count += 1;
            entry.last_activity = self.time.now();
        }
    }

    /// Snapshots the ids of every currently active agent, used by the
    /// Message Router to resolve a broadcast.
    #[must_use]
    pub fn active_ids(&self) -> HashSet<AgentInstanceId> {
        self.agents
            .iter()
            .filter(|entry| entry.value().status == AgentStatus::Active)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Captures `last_activity`/`connected_at` for every agent as of now,
    /// used by discovery.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns the current wall-clock time from this registry's time source,
    /// useful to callers that stamp derived records consistently.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.time.now()
    }
}

/// Shared handle type used throughout the orchestrator.
pub type SharedAgentRegistry = Arc<AgentRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn id(s: &str) -> AgentInstanceId {
        AgentInstanceId::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn register_then_duplicate_fails() {
        let registry = AgentRegistry::new(test_time_provider());
        registry.register(id("tech-1"), AgentType::Technical).unwrap();
        let err = registry.register(id("tech-1"), AgentType::Technical).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateAgent(id("tech-1")));
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let registry = AgentRegistry::new(test_time_provider());
        assert_eq!(
            registry.unregister(&id("ghost")).unwrap_err(),
            RegistryError::NotFound(id("ghost"))
        );
    }

    #[test]
    fn get_by_type_preserves_registration_order() {
        let registry = AgentRegistry::new(test_time_provider());
        registry.register(id("tech-1"), AgentType::Technical).unwrap();
        registry.register(id("tech-2"), AgentType::Technical).unwrap();
        let ids: Vec<_> = registry
            .get_by_type(AgentType::Technical)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![id("tech-1"), id("tech-2")]);
    }

    #[test]
    fn has_active_reflects_status_changes() {
        let registry = AgentRegistry::new(test_time_provider());
        registry.register(id("tech-1"), AgentType::Technical).unwrap();
        assert!(registry.has_active(AgentType::Technical));
        registry.set_status(&id("tech-1"), AgentStatus::Inactive).unwrap();
        assert!(!registry.has_active(AgentType::Technical));
    }
}
