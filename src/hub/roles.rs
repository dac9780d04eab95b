//! Agent roles and the fixed handoff graph.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The role that currently owns a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// First contact: collects the basic need.
    Intake,
    /// Fills BANT-style slots.
    Qualification,
    /// Books a meeting.
    Scheduling,
    /// Handles existing-customer issues. Terminal.
    Support,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        Self::Intake,
        Self::Qualification,
        Self::Scheduling,
        Self::Support,
    ];

    /// Check if a handoff from this role to `target` is allowed.
    pub fn can_transition_to(&self, target: AgentRole) -> bool {
        use AgentRole::*;

        matches!(
            (self, target),
            (Intake, Qualification)
                | (Intake, Support)
                | (Qualification, Scheduling)
                | (Qualification, Support)
                | (Scheduling, Support)
        )
    }

    /// Roles reachable in one handoff.
    pub fn targets(&self) -> Vec<AgentRole> {
        Self::ALL
            .into_iter()
            .filter(|t| self.can_transition_to(*t))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.targets().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Qualification => "qualification",
            Self::Scheduling => "scheduling",
            Self::Support => "support",
        }
    }
}

impl Default for AgentRole {
    fn default() -> Self {
        Self::Intake
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "qualification" => Ok(Self::Qualification),
            "scheduling" => Ok(Self::Scheduling),
            "support" => Ok(Self::Support),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}
