//! Agent interface consumed by the router.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::roles::AgentRole;
use super::state::ConversationState;
use crate::error::AgentError;
use crate::ingress::NormalizedMessage;

/// What an agent says and which slots it filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub text: Option<String>,
    /// Slot updates merged into the conversation; `null` clears a slot.
    pub slots: BTreeMap<String, Value>,
}

impl AgentReply {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            slots: BTreeMap::new(),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.slots.insert(key.into(), value.into());
        self
    }
}

/// Result of one agent turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Keep ownership.
    Continue(AgentReply),
    /// Transfer ownership to `target`, carrying `payload` to its initializer.
    Handoff {
        reply: AgentReply,
        target: AgentRole,
        payload: Value,
    },
}

/// A per-contact engine instance. Engines may be cached between turns but
/// are always restored from the durable snapshot before use.
#[async_trait]
pub trait AgentEngine: Send {
    /// Reset internal state from the persisted snapshot (`null` for a
    /// fresh conversation or right after a handoff).
    async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError>;

    async fn process_turn(
        &mut self,
        msg: &NormalizedMessage,
        state: &ConversationState,
    ) -> Result<TurnOutcome, AgentError>;

    /// Initializer run once after this role receives a handoff.
    async fn on_handoff_received(
        &mut self,
        payload: &Value,
        state: &ConversationState,
    ) -> Result<AgentReply, AgentError>;

    /// Serializable internal state, persisted after every successful turn.
    fn snapshot(&self) -> Value;
}

/// Factory for a role's engines.
pub trait ConversationAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    fn build_engine(&self, contact_id: &str) -> Box<dyn AgentEngine>;
}

/// Agents by role.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<AgentRole, Arc<dyn ConversationAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent with the same role.
    pub fn register(&mut self, agent: Arc<dyn ConversationAgent>) {
        self.agents.insert(agent.role(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn ConversationAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, role: AgentRole) -> Result<Arc<dyn ConversationAgent>, AgentError> {
        self.agents
            .get(&role)
            .cloned()
            .ok_or(AgentError::Unregistered(role))
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<_> = self.agents.keys().copied().collect();
        roles.sort();
        roles
    }
}
