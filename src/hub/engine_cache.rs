//! Advisory cache of live agent engines.
//!
//! Engines are checked out for the duration of a turn and checked back in
//! afterwards. A cache miss only costs a rebuild: engines are restored from
//! the durable snapshot on every turn regardless.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::agent::AgentEngine;
use super::roles::AgentRole;

struct CachedEngine {
    role: AgentRole,
    engine: Box<dyn AgentEngine>,
    last_used: DateTime<Utc>,
}

pub struct EngineCache {
    engines: Mutex<HashMap<String, CachedEngine>>,
    idle_window: chrono::Duration,
    capacity: usize,
}

impl EngineCache {
    pub fn new(idle_window: Duration, capacity: usize) -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            idle_window: chrono::Duration::from_std(idle_window)
                .unwrap_or(chrono::Duration::MAX),
            capacity,
        }
    }

    /// Take the contact's engine if it belongs to `role` and is not idle.
    pub async fn checkout(
        &self,
        contact: &str,
        role: AgentRole,
        now: DateTime<Utc>,
    ) -> Option<Box<dyn AgentEngine>> {
        let cached = self.engines.lock().await.remove(contact)?;
        if cached.role != role || now - cached.last_used > self.idle_window {
            return None;
        }
        Some(cached.engine)
    }

    pub async fn checkin(
        &self,
        contact: &str,
        role: AgentRole,
        engine: Box<dyn AgentEngine>,
        now: DateTime<Utc>,
    ) {
        if self.capacity == 0 {
            return;
        }
        let mut engines = self.engines.lock().await;
        if !engines.contains_key(contact) && engines.len() >= self.capacity {
            let oldest = engines
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                engines.remove(&oldest);
                debug!(contact = %oldest, "Engine cache at capacity, evicted");
            }
        }
        engines.insert(
            contact.to_string(),
            CachedEngine {
                role,
                engine,
                last_used: now,
            },
        );
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut engines = self.engines.lock().await;
        let before = engines.len();
        engines.retain(|_, c| now - c.last_used <= self.idle_window);
        before - engines.len()
    }

    pub async fn len(&self) -> usize {
        self.engines.lock().await.len()
    }
}
