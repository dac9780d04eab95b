//! Qualification: fills the BANT slots one question at a time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::slots::{self, Slot};
use super::{restore_memory, snapshot_memory};
use crate::error::AgentError;
use crate::hub::{AgentEngine, AgentReply, AgentRole, ConversationAgent, ConversationState, TurnOutcome};
use crate::ingress::NormalizedMessage;

pub struct QualificationAgent;

impl ConversationAgent for QualificationAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Qualification
    }

    fn build_engine(&self, _contact_id: &str) -> Box<dyn AgentEngine> {
        Box::new(QualificationEngine::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QualificationMemory {
    /// Slot the last question asked for; a bare answer fills it.
    asking: Option<Slot>,
    questions: u32,
}

#[derive(Default)]
pub struct QualificationEngine {
    memory: QualificationMemory,
}

impl QualificationEngine {
    /// Ask for the next missing slot, or hand off once all are known.
    fn next_step(&mut self, known: &BTreeMap<String, Value>, found: BTreeMap<String, Value>) -> TurnOutcome {
        let mut merged = known.clone();
        merged.extend(found.iter().map(|(k, v)| (k.clone(), v.clone())));

        match Slot::first_missing(&merged) {
            Some(slot) => {
                self.memory.asking = Some(slot);
                self.memory.questions += 1;
                let mut reply = AgentReply::say(slot.question());
                reply.slots = found;
                TurnOutcome::Continue(reply)
            }
            None => {
                self.memory.asking = None;
                let payload: Map<String, Value> = Slot::ALL
                    .iter()
                    .filter_map(|s| merged.get(s.key()).map(|v| (s.key().to_string(), v.clone())))
                    .collect();
                let mut reply = AgentReply::say("Thanks, that's everything I needed.");
                reply.slots = found;
                TurnOutcome::Handoff {
                    reply,
                    target: AgentRole::Scheduling,
                    payload: Value::Object(payload),
                }
            }
        }
    }
}

#[async_trait]
impl AgentEngine for QualificationEngine {
    async fn restore(&mut self, snapshot: &Value) -> Result<(), AgentError> {
        self.memory = restore_memory(AgentRole::Qualification, snapshot)?;
        Ok(())
    }

    async fn process_turn(
        &mut self,
        msg: &NormalizedMessage,
        state: &ConversationState,
    ) -> Result<TurnOutcome, AgentError> {
        let text = msg.text.trim();

        if slots::wants_support(text) {
            return Ok(TurnOutcome::Handoff {
                reply: AgentReply::silent(),
                target: AgentRole::Support,
                payload: serde_json::json!({ "issue": text }),
            });
        }

        let mut found = slots::extract(text);
        if let Some(slot) = self.memory.asking {
            if !found.contains_key(slot.key()) && !text.is_empty() {
                found.insert(slot.key().to_string(), Value::String(text.to_string()));
            }
        }
        Ok(self.next_step(&state.slots, found))
    }

    async fn on_handoff_received(
        &mut self,
        payload: &Value,
        state: &ConversationState,
    ) -> Result<AgentReply, AgentError> {
        let carried: BTreeMap<String, Value> = payload
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        match self.next_step(&state.slots, carried) {
            TurnOutcome::Continue(mut reply) => {
                reply.text = reply
                    .text
                    .map(|q| format!("Happy to help with that. {q}"));
                Ok(reply)
            }
            TurnOutcome::Handoff { .. } => Err(AgentError::HandoffRejected {
                role: AgentRole::Qualification,
                reason: "lead is already fully qualified".to_string(),
            }),
        }
    }

    fn snapshot(&self) -> Value {
        snapshot_memory(&self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn state_with(slots: Value) -> ConversationState {
        let mut state = ConversationState::new("5511", Utc::now());
        state.slots = serde_json::from_value(slots).unwrap();
        state
    }

    async fn turn(engine: &mut QualificationEngine, state: &ConversationState, text: &str) -> TurnOutcome {
        let msg = NormalizedMessage::from_text("5511", text, Utc::now());
        engine.process_turn(&msg, state).await.unwrap()
    }

    #[tokio::test]
    async fn initializer_keeps_carried_slots_and_asks_next() {
        let mut engine = QualificationEngine::default();
        let state = ConversationState::new("5511", Utc::now());
        let reply = engine
            .on_handoff_received(&json!({"need": "a CRM", "budget": "$5k"}), &state)
            .await
            .unwrap();

        assert_eq!(reply.slots["need"], json!("a CRM"));
        assert_eq!(reply.slots["budget"], json!("$5k"));
        assert_eq!(
            reply.text.as_deref(),
            Some("Happy to help with that. Who else is involved in the decision?")
        );
        assert_eq!(engine.memory.asking, Some(Slot::Authority));
    }

    #[tokio::test]
    async fn bare_answer_fills_asked_slot() {
        let mut engine = QualificationEngine::default();
        engine.memory.asking = Some(Slot::Authority);
        let state = state_with(json!({"need": "a CRM", "budget": "$5k"}));

        let TurnOutcome::Continue(reply) = turn(&mut engine, &state, "just me and my cofounder").await else {
            panic!("expected continue");
        };
        assert_eq!(reply.slots["authority"], json!("just me and my cofounder"));
        assert_eq!(reply.text.as_deref(), Some(Slot::Timeline.question()));
    }

    #[tokio::test]
    async fn complete_slots_hand_off_to_scheduling() {
        let mut engine = QualificationEngine::default();
        engine.memory.asking = Some(Slot::Timeline);
        let state = state_with(json!({"need": "a CRM", "budget": "$5k", "authority": "me"}));

        let outcome = turn(&mut engine, &state, "next month").await;
        let TurnOutcome::Handoff { target, payload, reply } = outcome else {
            panic!("expected handoff");
        };
        assert_eq!(target, AgentRole::Scheduling);
        assert_eq!(payload["timeline"], json!("next month"));
        assert_eq!(payload["need"], json!("a CRM"));
        assert_eq!(reply.slots["timeline"], json!("next month"));
    }

    #[tokio::test]
    async fn fully_qualified_payload_is_rejected() {
        let mut engine = QualificationEngine::default();
        let state = ConversationState::new("5511", Utc::now());
        let payload = json!({"need": "x", "budget": "1k", "authority": "me", "timeline": "q3"});
        assert!(engine.on_handoff_received(&payload, &state).await.is_err());
    }

    #[tokio::test]
    async fn support_request_leaves_qualification() {
        let mut engine = QualificationEngine::default();
        let state = ConversationState::new("5511", Utc::now());
        assert!(matches!(
            turn(&mut engine, &state, "actually my account is broken").await,
            TurnOutcome::Handoff { target: AgentRole::Support, .. }
        ));
    }
}
