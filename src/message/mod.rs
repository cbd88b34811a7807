//! Messaging subsystem: wire types, the Message Router, and the Message Bus.

pub mod bus;
pub mod router;
pub mod types;

pub use bus::{BusConfig, BusError, BusStats, MessageBus, SendOptions, SendOutcome, SharedMessageBus};
pub use router::{MessageRouter, SharedMessageRouter, DEFAULT_MAX_HISTORY};
pub use types::{
    Decision, GrantSummary, HistoryFilter, Message, MessagePayload, MessageType, Priority,
    QueuedMessage, Recipient,
};
