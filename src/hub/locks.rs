//! Per-contact single-flight locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map size at which inserting a new contact first prunes idle locks.
const MIN_PRUNE_AT: usize = 64;

struct Inner {
    locks: HashMap<String, Arc<Mutex<()>>>,
    prune_at: usize,
}

impl Inner {
    /// Drop locks nobody holds or waits on.
    fn prune(&mut self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, l| Arc::strong_count(l) > 1);
        self.prune_at = (self.locks.len() * 2).max(MIN_PRUNE_AT);
        before - self.locks.len()
    }
}

pub struct ContactLocks {
    inner: Mutex<Inner>,
}

impl Default for ContactLocks {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                locks: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `contact`. Held until the guard drops.
    pub async fn lock(&self, contact: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().await;
            if !inner.locks.contains_key(contact) && inner.locks.len() >= inner.prune_at {
                inner.prune();
            }
            Arc::clone(inner.locks.entry(contact.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    pub async fn prune(&self) -> usize {
        self.inner.lock().await.prune()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.locks.len()
    }
}
