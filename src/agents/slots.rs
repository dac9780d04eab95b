//! Regex slot extraction shared by the built-in agents.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// BANT-style qualification slots, in the order they are asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Need,
    Budget,
    Authority,
    Timeline,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Self::Need, Self::Budget, Self::Authority, Self::Timeline];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Need => "need",
            Self::Budget => "budget",
            Self::Authority => "authority",
            Self::Timeline => "timeline",
        }
    }

    pub fn question(&self) -> &'static str {
        match self {
            Self::Need => "What are you looking to solve?",
            Self::Budget => "Do you have a budget range in mind?",
            Self::Authority => "Who else is involved in the decision?",
            Self::Timeline => "When are you hoping to have this in place?",
        }
    }

    /// First slot not yet present in `slots`.
    pub fn first_missing(slots: &BTreeMap<String, Value>) -> Option<Slot> {
        Self::ALL
            .into_iter()
            .find(|s| slots.get(s.key()).is_none_or(is_blank))
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

static NEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:need|needs|looking for|want|interested in|require|preciso de|preciso|quero)\s+([^.,;!?]{3,})",
    )
    .unwrap()
});

static BUDGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:(?:r\$|us\$|\$|€|£)\s*\d[\d.,]*\s*(?:k|mil|thousand|million)?|\b\d[\d.,]*\s*(?:k|mil|thousand|million|dollars|reais|euros)\b)",
    )
    .unwrap()
});

static AUTHORITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i(?:'m| am) the (?:owner|founder|ceo|cto|director|manager|decision[- ]maker)|i decide|it'?s my (?:call|decision)|my (?:boss|manager|partner|team) (?:decides|will decide)|needs? approval(?: from [a-z ]+)?)",
    )
    .unwrap()
});

static TIMELINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:asap|immediately|urgently|today|tomorrow|this (?:week|month|quarter|year)|next (?:week|month|quarter|year)|(?:in|within) \d+ (?:days?|weeks?|months?)|q[1-4])\b",
    )
    .unwrap()
});

static SUPPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:support|help ?desk|broken|not working|doesn'?t work|error|bug|refund|complaint|cancel my|my (?:order|account|invoice|subscription))\b",
    )
    .unwrap()
});

/// Need statement, if the text expresses one.
pub fn need(text: &str) -> Option<String> {
    NEED.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_match(re: &Regex, text: &str) -> Option<String> {
    re.find(text).map(|m| m.as_str().trim().to_string())
}

/// Every slot recognizable in `text`.
pub fn extract(text: &str) -> BTreeMap<String, Value> {
    let mut slots = BTreeMap::new();
    let found = [
        (Slot::Need, need(text)),
        (Slot::Budget, first_match(&BUDGET, text)),
        (Slot::Authority, first_match(&AUTHORITY, text)),
        (Slot::Timeline, first_match(&TIMELINE, text)),
    ];
    for (slot, value) in found {
        if let Some(value) = value {
            slots.insert(slot.key().to_string(), Value::String(value));
        }
    }
    slots
}

/// Whether the text reads like an existing-customer support request.
pub fn wants_support(text: &str) -> bool {
    SUPPORT.is_match(text)
}
