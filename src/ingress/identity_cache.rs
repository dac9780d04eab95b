//! Bounded, TTL-evicted set of recently processed message identities.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

struct Inner {
    seen: HashMap<String, DateTime<Utc>>,
    /// Insertion order. May hold stale entries for ids that were removed or
    /// re-inserted; those are skipped when their timestamp no longer matches
    /// and compacted away once the queue reaches twice the capacity.
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl Inner {
    fn is_live(&self, id: &str, inserted_at: DateTime<Utc>) -> bool {
        self.seen.get(id) == Some(&inserted_at)
    }

    fn expire(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((id, at)) = self.order.front() {
            if *at > cutoff {
                break;
            }
            if self.is_live(id, *at) {
                self.seen.remove(id);
                removed += 1;
            }
            self.order.pop_front();
        }
        removed
    }

    /// Drop order entries for ids that were removed or re-inserted.
    fn compact(&mut self) {
        let seen = &self.seen;
        self.order.retain(|(id, at)| seen.get(id) == Some(at));
    }

    fn evict_oldest(&mut self) {
        while let Some((id, at)) = self.order.pop_front() {
            if self.is_live(&id, at) {
                self.seen.remove(&id);
                return;
            }
        }
    }
}

/// Set of message identities seen within the dedup window.
pub struct IdentityCache {
    inner: Mutex<Inner>,
    window: chrono::Duration,
    capacity: usize,
}

impl IdentityCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60)),
            capacity: capacity.max(1),
        }
    }

    /// Atomically check and record `id`. Returns `true` if the id is new
    /// (the caller owns processing), `false` if it was already seen within
    /// the window.
    pub async fn check_and_insert(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;

        if let Some(at) = inner.seen.get(id) {
            if now - *at < self.window {
                return false;
            }
            inner.seen.remove(id);
        }

        inner.expire(now - self.window);
        while inner.seen.len() >= self.capacity {
            inner.evict_oldest();
        }
        if inner.order.len() >= self.capacity.saturating_mul(2) {
            inner.compact();
        }

        inner.seen.insert(id.to_string(), now);
        inner.order.push_back((id.to_string(), now));
        true
    }

    /// Forget `id` so a redelivery is admitted again. Used when processing
    /// of the admitted message failed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.seen.remove(id).is_some()
    }

    /// Drop entries older than the window. Lookups expire lazily, so this
    /// only reclaims memory.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let removed = inner.expire(now - self.window);
        if removed > 0 {
            debug!(removed, remaining = inner.seen.len(), "Swept message identities");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache(cap: usize) -> IdentityCache {
        IdentityCache::new(Duration::from_secs(60), cap)
    }

    #[tokio::test]
    async fn second_insert_within_window_is_rejected() {
        let cache = cache(10);
        let now = Utc::now();
        assert!(cache.check_and_insert("m1", now).await);
        assert!(!cache.check_and_insert("m1", now + chrono::Duration::seconds(59)).await);
    }

    #[tokio::test]
    async fn entry_expires_after_window() {
        let cache = cache(10);
        let now = Utc::now();
        assert!(cache.check_and_insert("m1", now).await);
        assert!(cache.check_and_insert("m1", now + chrono::Duration::seconds(61)).await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_first() {
        let cache = cache(3);
        let now = Utc::now();
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            assert!(cache.check_and_insert(id, now + chrono::Duration::seconds(i as i64)).await);
        }
        assert_eq!(cache.len().await, 3);
        // "a" was evicted, "b" is still tracked.
        let later = now + chrono::Duration::seconds(5);
        assert!(cache.check_and_insert("a", later).await);
        assert!(!cache.check_and_insert("c", later).await);
    }

    #[tokio::test]
    async fn sweep_skips_reinserted_ids() {
        let cache = cache(10);
        let t0 = Utc::now();
        cache.check_and_insert("m1", t0).await;
        let t1 = t0 + chrono::Duration::seconds(90);
        assert!(cache.check_and_insert("m1", t1).await);

        // The stale (m1, t0) order entry must not remove the live one.
        assert_eq!(cache.sweep(t1 + chrono::Duration::seconds(1)).await, 0);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.sweep(t1 + chrono::Duration::seconds(61)).await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn reinserted_ids_do_not_grow_the_order_queue() {
        let cache = cache(4);
        let t0 = Utc::now();
        for round in 0..50 {
            let at = t0 + chrono::Duration::seconds(61 * round);
            assert!(cache.check_and_insert("m1", at).await);
        }
        let inner = cache.inner.lock().await;
        assert_eq!(inner.seen.len(), 1);
        assert!(inner.order.len() <= 2);
    }

    #[tokio::test]
    async fn removed_id_is_admitted_again() {
        let cache = cache(4);
        let now = Utc::now();
        assert!(cache.check_and_insert("m1", now).await);
        assert!(cache.remove("m1").await);
        assert!(cache.check_and_insert("m1", now).await);
        assert!(!cache.check_and_insert("m1", now).await);

        // Removals leave order entries behind; compaction bounds them.
        for i in 0..20 {
            let id = format!("r{i}");
            cache.check_and_insert(&id, now).await;
            cache.remove(&id).await;
        }
        assert!(cache.inner.lock().await.order.len() <= 8);
    }

    #[tokio::test]
    async fn concurrent_inserts_admit_exactly_one() {
        let cache = Arc::new(cache(100));
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.check_and_insert("dup", now).await
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
