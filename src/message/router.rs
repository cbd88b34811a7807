//! Message Router
//!
//! Assigns identity and history to messages and hands them off to
//! per-agent subscriber channels. The Message Bus sits in front of this and
//! owns retry/priority semantics; the router itself is a thin, synchronous
//! dispatch layer.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::agent::AgentType;
use crate::domain_types::{AgentInstanceId, MessageId};
use crate::message::types::{HistoryFilter, Message, MessagePayload, Recipient};
use crate::registry::SharedAgentRegistry;
use crate::time_provider::SharedTimeProvider;

/// Default cap on retained message history.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Routes messages to subscribers and retains a capped history.
pub struct MessageRouter {
    history: RwLock<VecDeque<Message>>,
    max_history: usize,
    subscribers: dashmap::DashMap<AgentInstanceId, mpsc::UnboundedSender<Message>>,
    registry: SharedAgentRegistry,
    time: SharedTimeProvider,
}

impl MessageRouter {
    /// Creates a router backed by `registry` for recipient resolution.
    #[must_use]
    pub fn new(registry: SharedAgentRegistry, time: SharedTimeProvider) -> Self {
        Self::with_max_history(registry, time, DEFAULT_MAX_HISTORY)
    }

    /// Creates a router with a non-default history cap (used by tests that
    /// want to exercise pruning without enqueuing thousands of messages).
    #[must_use]
    pub fn with_max_history(
        registry: SharedAgentRegistry,
        time: SharedTimeProvider,
        max_history: usize,
    ) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(max_history.min(256))),
            max_history,
            subscribers: dashmap::DashMap::new(),
            registry,
            time,
        }
    }

    /// Assigns an id and timestamp to `payload`, records it in history, and
    /// notifies subscribers of the resolved recipient set.
    ///
    /// `from_instance`, when given, has its `last_activity` bumped — the
    /// wire-level `Message.from` is only an [`AgentType`], so bumping a
    /// specific registry entry requires the caller to name which instance
    /// sent it.
    pub async fn route(
        &self,
        from: AgentType,
        to: Recipient,
        payload: MessagePayload,
        from_instance: Option<&AgentInstanceId>,
    ) -> Message {
        let message = Message {
            id: MessageId::generate(),
            from,
            to,
            payload,
            timestamp: self.time.now(),
        };

        {
            let mut history = self.history.write().await;
            history.push_back(message.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        if let Some(id) = from_instance {
            let _ = self.registry.update_activity(id);
        }

        self.notify_subscribers(&message).await;
        trace!(message_id = %message.id, from = %message.from, "message routed");
        message
    }

    async fn notify_subscribers(&self, message: &Message) {
        for recipient_id in self.resolve_recipients(&message.to) {
            if let Some(sender) = self.subscribers.get(&recipient_id) {
                // An unregistered receiver (channel dropped, not yet
                // unsubscribed) is not the router's problem to recover from.
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Resolves a [`Recipient`] into the set of currently active agent
    /// instance ids that should receive it.
    #[must_use]
    pub fn resolve_recipients(&self, to: &Recipient) -> Vec<AgentInstanceId> {
        match to {
            Recipient::Broadcast => self.registry.active_ids().into_iter().collect(),
            Recipient::One(agent_type) => self.active_instances_of(*agent_type),
            Recipient::Many(types) => types
                .iter()
                .flat_map(|t| self.active_instances_of(*t))
                .collect(),
        }
    }

    fn active_instances_of(&self, agent_type: AgentType) -> Vec<AgentInstanceId> {
        self.registry
            .get_by_type(agent_type)
            .into_iter()
            .filter(|info| info.status == crate::agent::AgentStatus::Active)
            .map(|info| info.id)
            .collect()
    }

    /// Wires a channel for `agent_id`, replacing any previous subscription.
    #[must_use]
    pub fn subscribe(&self, agent_id: AgentInstanceId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(agent_id, tx);
        rx
    }

    /// Removes an agent's subscription, if any.
    pub fn unsubscribe(&self, agent_id: &AgentInstanceId) {
        self.subscribers.remove(agent_id);
        debug!(agent_id = %agent_id, "unsubscribed from router");
    }

    /// Returns a filtered snapshot of history.
    pub async fn history(&self, filter: &HistoryFilter) -> Vec<Message> {
        let history = self.history.read().await;
        let as_vec: Vec<Message> = history.iter().cloned().collect();
        filter.apply(&as_vec)
    }

    /// Empties history. Subscriptions are unaffected.
    pub async fn clear(&self) {
        self.history.write().await.clear();
    }

    /// Drops history entries older than `cutoff`, keeping everything else.
    pub async fn prune_before(&self, cutoff: std::time::SystemTime) {
        self.history.write().await.retain(|m| m.timestamp >= cutoff);
    }

    /// Current history length, for stats/introspection.
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    /// The set of agent types with at least one active subscriber — used by
    /// the bus to decide whether a recipient is currently reachable.
    #[must_use]
    pub fn active_types(&self) -> HashSet<AgentType> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|info| info.status == crate::agent::AgentStatus::Active)
            .map(|info| info.agent_type)
            .collect()
    }
}

/// Shared handle type used throughout the orchestrator.
pub type SharedMessageRouter = Arc<MessageRouter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;
    use crate::domain_types::AgentInstanceId;
    use crate::message::types::MessagePayload;
    use crate::registry::AgentRegistry;
    use crate::time_provider::test_time_provider;

    fn instance(s: &str) -> AgentInstanceId {
        AgentInstanceId::try_new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn route_delivers_to_subscribed_recipient() {
        let registry = Arc::new(AgentRegistry::new(test_time_provider()));
        registry.register(instance("tech-1"), AgentType::Technical).unwrap();
        let router = MessageRouter::new(registry, test_time_provider());

        let mut rx = router.subscribe(instance("tech-1"));
        router
            .route(
                AgentType::Coordinator,
                Recipient::One(AgentType::Technical),
                MessagePayload::SystemStatus { detail: "hi".into() },
                None,
            )
            .await;

        let received = rx.recv().await.expect("message delivered");
        assert_eq!(received.from, AgentType::Coordinator);
    }

    #[tokio::test]
    async fn history_is_capped_and_prunes_oldest() {
        let registry = Arc::new(AgentRegistry::new(test_time_provider()));
        let router = MessageRouter::with_max_history(registry, test_time_provider(), 3);
        for i in 0..5 {
            router
                .route(
                    AgentType::Coordinator,
                    Recipient::Broadcast,
                    MessagePayload::SystemStatus { detail: format!("{i}") },
                    None,
                )
                .await;
        }
        assert_eq!(router.history_len().await, 3);
        let all = router.history(&HistoryFilter::default()).await;
        let MessagePayload::SystemStatus { detail } = &all[0].payload else {
            panic!("unexpected payload")
        };
        assert_eq!(detail, "2");
    }

    #[tokio::test]
    async fn broadcast_resolves_to_all_active_instances() {
        let registry = Arc::new(AgentRegistry::new(test_time_provider()));
        registry.register(instance("tech-1"), AgentType::Technical).unwrap();
        registry.register(instance("impact-1"), AgentType::Impact).unwrap();
        let router = MessageRouter::new(registry, test_time_provider());
        let recipients = router.resolve_recipients(&Recipient::Broadcast);
        assert_eq!(recipients.len(), 2);
    }
}
