//! Support: acknowledges existing-customer issues. Terminal role.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{restore_memory, snapshot_memory};
use crate::error::AgentError;
use crate::hub::{AgentEngine, AgentReply, AgentRole, ConversationAgent, ConversationState, TurnOutcome};
use crate::ingress::NormalizedMessage;

pub struct SupportAgent;

impl ConversationAgent for SupportAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Support
    }

    fn build_engine(&self, _contact_id: &str) -> Box<dyn AgentEngine> {
        Box::new(SupportEngine::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SupportMemory {
    notes: u32,
}

#[derive(Default)]
pub struct SupportEngine {
    memory: SupportMemory,
}

#[async_trait]
impl AgentEngine for SupportEngine {
    async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
        self.memory = restore_memory(AgentRole::Support, snapshot)?;
        Ok(())
    }

    async fn process_turn(
        &mut self,
        msg: &NormalizedMessage,
        _state: &ConversationState,
    ) -> Result<TurnOutcome, AgentError> {
        self.memory.notes += 1;
        Ok(TurnOutcome::Continue(
            AgentReply::say("Thanks, I've added that to your ticket.")
                .with_slot("last_note", msg.text.trim()),
        ))
    }

    async fn on_handoff_received(
        &mut self,
        payload: &Value,
        _state: &ConversationState,
    ) -> Result<AgentReply, AgentError> {
        let mut reply = AgentReply::say(
            "Sorry about the trouble. I've opened a ticket and a specialist will follow up here.",
        );
        if let Some(issue) = payload.get("issue").and_then(Value::as_str) {
            reply = reply.with_slot("issue", issue);
        }
        Ok(reply)
    }

    fn snapshot(&self) -> Value {
        snapshot_memory(&self.memory)
    }
}
