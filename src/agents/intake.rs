//! Intake: greets new contacts and routes them by what they ask for.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{restore_memory, slots, snapshot_memory};
use crate::error::AgentError;
use crate::hub::{AgentEngine, AgentReply, AgentRole, ConversationAgent, ConversationState, TurnOutcome};
use crate::ingress::NormalizedMessage;

/// Unanswered prompts before intake hands the contact to qualification
/// anyway, carrying whatever they said.
const MAX_PROMPTS: u32 = 3;

pub struct IntakeAgent;

impl ConversationAgent for IntakeAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Intake
    }

    fn build_engine(&self, _contact_id: &str) -> Box<dyn AgentEngine> {
        Box::new(IntakeEngine::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IntakeMemory {
    greeted: bool,
    prompts: u32,
}

#[derive(Default)]
pub struct IntakeEngine {
    memory: IntakeMemory,
}

impl IntakeEngine {
    fn greeting(msg: &NormalizedMessage) -> String {
        match msg.push_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("Hi {name}! What can we help you with?"),
            None => "Hi! What can we help you with?".to_string(),
        }
    }
}

#[async_trait]
impl AgentEngine for IntakeEngine {
    async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
        self.memory = restore_memory(AgentRole::Intake, snapshot)?;
        Ok(())
    }

    async fn process_turn(
        &mut self,
        msg: &NormalizedMessage,
        _state: &ConversationState,
    ) -> Result<TurnOutcome, AgentError> {
        let text = msg.text.trim();

        if slots::wants_support(text) {
            return Ok(TurnOutcome::Handoff {
                reply: AgentReply::silent(),
                target: AgentRole::Support,
                payload: serde_json::json!({ "issue": text }),
            });
        }

        let found = slots::extract(text);
        if found.contains_key("need") || self.memory.prompts >= MAX_PROMPTS {
            let mut payload: Map<String, Value> = found.into_iter().collect();
            payload
                .entry("need")
                .or_insert_with(|| Value::String(text.to_string()));
            return Ok(TurnOutcome::Handoff {
                reply: AgentReply::silent(),
                target: AgentRole::Qualification,
                payload: Value::Object(payload),
            });
        }

        self.memory.prompts += 1;
        let reply = if self.memory.greeted {
            AgentReply::say("Could you tell me a bit more about what you're looking for?")
        } else {
            self.memory.greeted = true;
            AgentReply::say(Self::greeting(msg))
        };
        Ok(TurnOutcome::Continue(reply))
    }

    async fn on_handoff_received(
        &mut self,
        _payload: &Value,
        _state: &ConversationState,
    ) -> Result<AgentReply, AgentError> {
        // Nothing hands off to intake.
        Err(AgentError::HandoffRejected {
            role: AgentRole::Intake,
            reason: "intake is the entry role".to_string(),
        })
    }

    fn snapshot(&self) -> Value {
        snapshot_memory(&self.memory)
    }
}
