//! Per-contact record of the last outbound send, read by the classifier's
//! latency signal.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ingress::payload::normalize_contact_id;

pub struct OutboundTimestamps {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: chrono::Duration,
    capacity: usize,
}

impl OutboundTimestamps {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(10)),
            capacity: capacity.max(1),
        }
    }

    fn key(contact: &str) -> String {
        normalize_contact_id(contact).unwrap_or_else(|| contact.to_string())
    }

    /// Record a successful send to `contact`.
    pub async fn record(&self, contact: &str, at: DateTime<Utc>) {
        let key = Self::key(contact);
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, at);
    }

    /// Read the last send time. The entry is consumed unless `preserve` is
    /// set (used while a verification challenge is pending, so every reply
    /// in the handshake is measured against the same send). Expired entries
    /// are never returned, preserved or not.
    pub async fn read(
        &self,
        contact: &str,
        now: DateTime<Utc>,
        preserve: bool,
    ) -> Option<DateTime<Utc>> {
        let key = Self::key(contact);
        let mut entries = self.entries.lock().await;
        let at = *entries.get(&key)?;
        if now - at > self.ttl {
            entries.remove(&key);
            return None;
        }
        if !preserve {
            entries.remove(&key);
        }
        Some(at)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, at| now - *at <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept outbound timestamps");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
