//! Error types for lead-relay.

use crate::hub::roles::AgentRole;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors. These are the only failures allowed to abort a
/// webhook request: continuing with unpersisted state risks duplicate
/// handoffs on the next turn.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stale write for {entity} {id}: expected version {expected}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },
}

/// Outbound channel errors, produced by the send primitive.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("Channel {name} rejected recipient {recipient}")]
    InvalidRecipient { name: String, recipient: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ChannelError {
    /// Whether another attempt could succeed. A rejected recipient will be
    /// rejected again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidRecipient { .. })
    }
}

/// Terminal outcomes of the delivery manager. Cloneable so that requests
/// attached to an in-flight send observe the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery to {recipient} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        recipient: String,
        attempts: u32,
        last_error: String,
    },

    #[error("In-flight delivery to {recipient} was abandoned")]
    Abandoned { recipient: String },
}

/// Errors raised by agent engines. Contained at the hub; never surfaced to
/// the contact.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {role} turn failed: {reason}")]
    TurnFailed { role: AgentRole, reason: String },

    #[error("Agent {role} could not restore its snapshot: {reason}")]
    Restore { role: AgentRole, reason: String },

    #[error("Handoff from {from} to {to} is not allowed")]
    InvalidHandoff { from: AgentRole, to: AgentRole },

    #[error("Agent {role} rejected handoff payload: {reason}")]
    HandoffRejected { role: AgentRole, reason: String },

    #[error("Agent {role} panicked during a turn")]
    Panicked { role: AgentRole },

    #[error("No agent registered for role {0}")]
    Unregistered(AgentRole),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
