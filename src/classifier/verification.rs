//! Verification handshake: challenge records and the confirmation matcher.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a contact stands in the verification handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Never challenged.
    #[default]
    None,
    /// Challenge issued, waiting for a confirmation.
    Pending,
    /// Confirmed human. Terminal.
    Verified,
    /// Permanently blocked. Terminal.
    Blocked,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Blocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown verification status: {other}")),
        }
    }
}

/// Result of a wrong answer to a pending challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// Ask again; `attempt` is the new attempt number.
    Reissue { attempt: u32 },
    /// Budget exceeded; the challenge is now blocked.
    Exhausted,
}

/// Persisted challenge record for one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationChallenge {
    pub contact_id: String,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationChallenge {
    pub fn issue(contact_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            contact_id: contact_id.into(),
            status: VerificationStatus::Pending,
            attempts: 1,
            issued_at: now,
            updated_at: now,
        }
    }

    /// Pending and older than `timeout`. Evaluated lazily on the next message.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.status == VerificationStatus::Pending && now - self.issued_at > timeout
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, max_attempts: u32) -> FailureStep {
        self.attempts += 1;
        self.updated_at = now;
        if self.attempts > max_attempts {
            self.status = VerificationStatus::Blocked;
            FailureStep::Exhausted
        } else {
            FailureStep::Reissue {
                attempt: self.attempts,
            }
        }
    }

    pub fn verify(&mut self, now: DateTime<Utc>) {
        self.status = VerificationStatus::Verified;
        self.updated_at = now;
    }

    pub fn block(&mut self, now: DateTime<Utc>) {
        self.status = VerificationStatus::Blocked;
        self.updated_at = now;
    }
}

/// Whole-token confirmation matcher. A phrase matches when its tokens
/// appear as a contiguous run of the message's tokens, so "yes" matches
/// "yes, I am" but not "yesterday".
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    phrases: Vec<Vec<String>>,
}

impl PhraseMatcher {
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Self {
        Self {
            phrases: phrases
                .iter()
                .map(|p| tokenize(p.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let tokens = tokenize(text);
        self.phrases.iter().any(|phrase| {
            tokens
                .windows(phrase.len())
                .any(|window| window == phrase.as_slice())
        })
    }
}

/// Lower-case and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> PhraseMatcher {
        PhraseMatcher::new(&["yes", "sim", "i am human", "sou humano"])
    }

    #[test]
    fn matches_whole_tokens_only() {
        let m = matcher();
        assert!(m.matches("Yes"));
        assert!(m.matches("yes, it's me!"));
        assert!(m.matches("SIM"));
        assert!(!m.matches("yesterday I called"));
        assert!(!m.matches("simple question"));
        assert!(!m.matches("eyes"));
    }

    #[test]
    fn multi_word_phrases_must_be_contiguous() {
        let m = matcher();
        assert!(m.matches("ok, I am human."));
        assert!(m.matches("sou humano sim"));
        assert!(!m.matches("I really am a human"));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!matcher().matches(""));
        assert!(!PhraseMatcher::new::<&str>(&[]).matches("yes"));
        assert!(!PhraseMatcher::new(&["  "]).matches("anything"));
    }

    #[test]
    fn failures_exhaust_after_budget() {
        let now = Utc::now();
        let mut c = VerificationChallenge::issue("5511", now);
        assert_eq!(c.attempts, 1);
        assert_eq!(c.record_failure(now, 3), FailureStep::Reissue { attempt: 2 });
        assert_eq!(c.record_failure(now, 3), FailureStep::Reissue { attempt: 3 });
        assert_eq!(c.record_failure(now, 3), FailureStep::Exhausted);
        assert_eq!(c.status, VerificationStatus::Blocked);
    }

    #[test]
    fn expiry_only_applies_while_pending() {
        let now = Utc::now();
        let timeout = Duration::from_secs(600);
        let mut c = VerificationChallenge::issue("5511", now);
        let later = now + chrono::Duration::seconds(601);
        assert!(!c.is_expired(now, timeout));
        assert!(c.is_expired(later, timeout));
        c.verify(now);
        assert!(!c.is_expired(later, timeout));
    }

    #[test]
    fn status_round_trips() {
        for s in [
            VerificationStatus::None,
            VerificationStatus::Pending,
            VerificationStatus::Verified,
            VerificationStatus::Blocked,
        ] {
            assert_eq!(s.as_str().parse::<VerificationStatus>().unwrap(), s);
        }
        assert!(VerificationStatus::Blocked.is_terminal());
        assert!(!VerificationStatus::Pending.is_terminal());
    }
}
