//! Durable per-contact conversation state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::roles::AgentRole;
use crate::classifier::verification::VerificationStatus;
use crate::error::AgentError;

/// Maximum handoff records kept on the in-memory state. The full history
/// stays in the `handoffs` table.
const MAX_HANDOFF_HISTORY: usize = 50;

/// One ownership transfer between roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from: AgentRole,
    pub to: AgentRole,
    pub at: DateTime<Utc>,
    /// Snapshot of the data carried to the target.
    pub payload: Value,
}

/// A handoff whose target initializer has not completed yet. The target is
/// always the current role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHandoff {
    pub from: AgentRole,
    pub payload: Value,
    /// Initializer attempts so far.
    pub attempts: u32,
}

/// Everything the router persists for one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub contact_id: String,
    /// Only the router changes this, through [`ConversationState::apply_handoff`].
    pub(crate) current_role: AgentRole,
    /// Qualification slots shared across roles.
    pub slots: BTreeMap<String, Value>,
    /// Opaque snapshot owned by the active agent.
    pub agent_state: Value,
    pub pending_handoff: Option<PendingHandoff>,
    pub handoff_history: Vec<HandoffRecord>,
    pub verification: VerificationStatus,
    pub inbound_count: u64,
    pub outbound_count: u64,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(contact_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            contact_id: contact_id.into(),
            current_role: AgentRole::Intake,
            slots: BTreeMap::new(),
            agent_state: Value::Null,
            pending_handoff: None,
            handoff_history: Vec::new(),
            verification: VerificationStatus::None,
            inbound_count: 0,
            outbound_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_role(&self) -> AgentRole {
        self.current_role
    }

    /// Merge slot values. `null` removes a slot.
    pub fn merge_slots(&mut self, slots: BTreeMap<String, Value>) {
        for (k, v) in slots {
            if v.is_null() {
                self.slots.remove(&k);
            } else {
                self.slots.insert(k, v);
            }
        }
    }

    /// Transfer ownership to `target`, recording the handoff and leaving the
    /// target's initializer pending. The previous agent's snapshot is
    /// discarded; slots carry over.
    pub fn apply_handoff(
        &mut self,
        target: AgentRole,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<HandoffRecord, AgentError> {
        if !self.current_role.can_transition_to(target) {
            return Err(AgentError::InvalidHandoff {
                from: self.current_role,
                to: target,
            });
        }

        let record = HandoffRecord {
            from: self.current_role,
            to: target,
            at: now,
            payload: payload.clone(),
        };
        self.handoff_history.push(record.clone());
        if self.handoff_history.len() > MAX_HANDOFF_HISTORY {
            let drain = self.handoff_history.len() - MAX_HANDOFF_HISTORY;
            self.handoff_history.drain(..drain);
        }

        self.pending_handoff = Some(PendingHandoff {
            from: self.current_role,
            payload,
            attempts: 0,
        });
        self.current_role = target;
        self.agent_state = Value::Null;
        self.updated_at = now;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_state_starts_at_intake() {
        let state = ConversationState::new("5511", Utc::now());
        assert_eq!(state.current_role(), AgentRole::Intake);
        assert_eq!(state.version, 0);
        assert!(state.pending_handoff.is_none());
    }

    #[test]
    fn handoff_swaps_role_and_records_history() {
        let mut state = ConversationState::new("5511", Utc::now());
        state.agent_state = json!({"turns": 2});
        state.slots.insert("need".into(), json!("crm"));

        let record = state
            .apply_handoff(AgentRole::Qualification, json!({"need": "crm"}), Utc::now())
            .unwrap();

        assert_eq!(record.from, AgentRole::Intake);
        assert_eq!(record.to, AgentRole::Qualification);
        assert_eq!(state.current_role(), AgentRole::Qualification);
        assert_eq!(state.handoff_history, vec![record]);
        assert_eq!(state.agent_state, Value::Null);
        assert_eq!(state.slots["need"], json!("crm"));
        let pending = state.pending_handoff.unwrap();
        assert_eq!(pending.from, AgentRole::Intake);
        assert_eq!(pending.payload, json!({"need": "crm"}));
    }

    #[test]
    fn invalid_handoff_leaves_state_untouched() {
        let mut state = ConversationState::new("5511", Utc::now());
        let err = state
            .apply_handoff(AgentRole::Scheduling, json!({}), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidHandoff { .. }));
        assert_eq!(state.current_role(), AgentRole::Intake);
        assert!(state.handoff_history.is_empty());
    }

    #[test]
    fn merge_slots_removes_nulls() {
        let mut state = ConversationState::new("5511", Utc::now());
        state.merge_slots(BTreeMap::from([
            ("budget".to_string(), json!(5000)),
            ("need".to_string(), json!("crm")),
        ]));
        state.merge_slots(BTreeMap::from([("need".to_string(), Value::Null)]));
        assert_eq!(state.slots.len(), 1);
        assert_eq!(state.slots["budget"], json!(5000));
    }

    #[test]
    fn state_serializes_role_as_snake_case() {
        let state = ConversationState::new("5511", Utc::now());
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["current_role"], "intake");
        assert_eq!(v["verification"], "none");
    }
}
