//! Built-in rule-based agents, one per role.

pub mod intake;
pub mod qualification;
pub mod scheduling;
pub mod slots;
pub mod support;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::AgentError;
use crate::hub::{AgentRegistry, AgentRole};

pub use intake::IntakeAgent;
pub use qualification::QualificationAgent;
pub use scheduling::SchedulingAgent;
pub use support::SupportAgent;

/// Registry with every built-in agent.
pub fn builtin_registry() -> AgentRegistry {
    AgentRegistry::new()
        .with(Arc::new(IntakeAgent))
        .with(Arc::new(QualificationAgent))
        .with(Arc::new(SchedulingAgent))
        .with(Arc::new(SupportAgent))
}

/// Decode an engine's memory from its snapshot. `null` means fresh.
pub(crate) fn restore_memory<T>(role: AgentRole, snapshot: &Value) -> Result<T, AgentError>
where
    T: DeserializeOwned + Default,
{
    if snapshot.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(snapshot.clone()).map_err(|e| AgentError::Restore {
        role,
        reason: e.to_string(),
    })
}

pub(crate) fn snapshot_memory<T: Serialize>(memory: &T) -> Value {
    serde_json::to_value(memory).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_role() {
        assert_eq!(builtin_registry().roles(), AgentRole::ALL.to_vec());
    }

    #[test]
    fn bad_snapshot_is_a_restore_error() {
        #[derive(serde::Deserialize, Default)]
        struct Memory {
            #[allow(dead_code)]
            turns: u32,
        }
        let err = restore_memory::<Memory>(AgentRole::Intake, &serde_json::json!({"turns": "x"}))
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Restore { .. }));
    }
}
