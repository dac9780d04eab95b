//! Scheduling: agrees a meeting time with a qualified lead.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{restore_memory, slots, snapshot_memory};
use crate::error::AgentError;
use crate::hub::{AgentEngine, AgentReply, AgentRole, ConversationAgent, ConversationState, TurnOutcome};
use crate::ingress::NormalizedMessage;

static WHEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|today|tomorrow|segunda|terça|quarta|quinta|sexta)\b|\b\d{1,2}(?::\d{2}\s*(?:am|pm)?|\s*(?:am|pm|h))\b",
    )
    .unwrap()
});

pub struct SchedulingAgent;

impl ConversationAgent for SchedulingAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Scheduling
    }

    fn build_engine(&self, _contact_id: &str) -> Box<dyn AgentEngine> {
        Box::new(SchedulingEngine::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchedulingMemory {
    booked: Option<String>,
}

#[derive(Default)]
pub struct SchedulingEngine {
    memory: SchedulingMemory,
}

#[async_trait]
impl AgentEngine for SchedulingEngine {
    async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
        self.memory = restore_memory(AgentRole::Scheduling, snapshot)?;
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

        if let Some(booked) = &self.memory.booked {
            if !WHEN.is_match(text) {
                return Ok(TurnOutcome::Continue(AgentReply::say(format!(
                    "You're booked for {booked}. Anything else I can help with?"
                ))));
            }
        }

        if WHEN.is_match(text) {
            self.memory.booked = Some(text.to_string());
            return Ok(TurnOutcome::Continue(
                AgentReply::say(format!(
                    "Booked for {text}. You'll get a confirmation here shortly."
                ))
                .with_slot("meeting", text),
            ));
        }

        Ok(TurnOutcome::Continue(AgentReply::say(
            "Which day and time suit you best? For example, Tuesday at 10am.",
        )))
    }

    async fn on_handoff_received(
        &mut self,
        _payload: &Value,
        _state: &ConversationState,
    ) -> Result<AgentReply, AgentError> {
        self.memory = SchedulingMemory::default();
        Ok(AgentReply::say(
            "Let's set up a call with a specialist. What day and time work for you?",
        ))
    }

    fn snapshot(&self) -> Value {
        snapshot_memory(&self.memory)
    }
}
