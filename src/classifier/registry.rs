//! Ephemeral per-contact score records.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::signals::SignalScores;

/// Outcome of the last scoring pass for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDecision {
    Allow,
    Challenge,
    Block,
}

/// Rolling statistics for one contact. Dropped after an inactivity window.
#[derive(Debug, Clone, Serialize)]
pub struct BotScoreRecord {
    pub arrivals: VecDeque<DateTime<Utc>>,
    pub recent_texts: VecDeque<String>,
    pub scores: SignalScores,
    pub aggregate: f64,
    /// Penalty level carried into later messages, before decay.
    pub carried_penalty: f64,
    pub last_decision: Option<ScoreDecision>,
    pub last_seen: DateTime<Utc>,
}

impl BotScoreRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            arrivals: VecDeque::new(),
            recent_texts: VecDeque::new(),
            scores: SignalScores::default(),
            aggregate: 0.0,
            carried_penalty: 0.0,
            last_decision: None,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub ttl: Duration,
    pub capacity: usize,
    pub eviction_fraction: f64,
}

/// Bounded map of score records, internally synchronized.
pub struct ScoreRegistry {
    records: Mutex<HashMap<String, BotScoreRecord>>,
    ttl: chrono::Duration,
    limits: RegistryLimits,
}

impl ScoreRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(limits.ttl).unwrap_or(chrono::Duration::MAX),
            limits,
        }
    }

    /// Run `f` against the contact's record, creating it (or replacing an
    /// expired one) first. The record's `last_seen` is left for `f` to
    /// update, so `f` can still read the previous value.
    pub async fn with_record<T>(
        &self,
        contact: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut BotScoreRecord) -> T,
    ) -> T {
        let mut records = self.records.lock().await;

        let expired = records
            .get(contact)
            .is_some_and(|r| now - r.last_seen > self.ttl);
        if expired {
            records.remove(contact);
        }

        if !records.contains_key(contact) && records.len() >= self.limits.capacity {
            let count = ((records.len() as f64 * self.limits.eviction_fraction).ceil() as usize)
                .clamp(1, records.len());
            let mut by_age: Vec<(DateTime<Utc>, String)> = records
                .iter()
                .map(|(k, r)| (r.last_seen, k.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(count) {
                records.remove(&key);
            }
            debug!(evicted = count, "Score registry at capacity");
        }

        let record = records
            .entry(contact.to_string())
            .or_insert_with(|| BotScoreRecord::new(now));
        f(record)
    }

    pub async fn set_decision(&self, contact: &str, decision: ScoreDecision) {
        if let Some(record) = self.records.lock().await.get_mut(contact) {
            record.last_decision = Some(decision);
        }
    }

    pub async fn get(&self, contact: &str) -> Option<BotScoreRecord> {
        self.records.lock().await.get(contact).cloned()
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| now - r.last_seen <= self.ttl);
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> ScoreRegistry {
        ScoreRegistry::new(RegistryLimits {
            ttl: Duration::from_secs(1800),
            capacity,
            eviction_fraction: 0.2,
        })
    }

    async fn touch(reg: &ScoreRegistry, contact: &str, at: DateTime<Utc>) {
        reg.with_record(contact, at, |r| {
            r.arrivals.push_back(at);
            r.last_seen = at;
        })
        .await;
    }

    #[tokio::test]
    async fn record_is_created_lazily_and_reused() {
        let reg = registry(10);
        let now = Utc::now();
        touch(&reg, "a", now).await;
        touch(&reg, "a", now).await;
        assert_eq!(reg.get("a").await.unwrap().arrivals.len(), 2);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn inactive_record_is_reset() {
        let reg = registry(10);
        let now = Utc::now();
        touch(&reg, "a", now).await;
        touch(&reg, "a", now + chrono::Duration::seconds(1801)).await;
        assert_eq!(reg.get("a").await.unwrap().arrivals.len(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_fraction() {
        let reg = registry(10);
        let t0 = Utc::now();
        for i in 0..10 {
            touch(&reg, &format!("c{i}"), t0 + chrono::Duration::seconds(i)).await;
        }
        touch(&reg, "new", t0 + chrono::Duration::seconds(20)).await;
        assert_eq!(reg.len().await, 9);
        assert!(reg.get("c0").await.is_none());
        assert!(reg.get("c1").await.is_none());
        assert!(reg.get("c2").await.is_some());
    }

    #[tokio::test]
    async fn decision_is_recorded() {
        let reg = registry(10);
        let now = Utc::now();
        touch(&reg, "a", now).await;
        reg.set_decision("a", ScoreDecision::Challenge).await;
        assert_eq!(
            reg.get("a").await.unwrap().last_decision,
            Some(ScoreDecision::Challenge)
        );
    }

    #[tokio::test]
    async fn sweep_drops_inactive() {
        let reg = registry(10);
        let now = Utc::now();
        touch(&reg, "a", now).await;
        touch(&reg, "b", now + chrono::Duration::seconds(1000)).await;
        assert_eq!(reg.sweep(now + chrono::Duration::seconds(2000)).await, 1);
        assert!(reg.get("b").await.is_some());
    }
}
