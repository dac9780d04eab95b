//! Sent-history and in-flight registries behind one lock.
//!
//! `begin` performs check-then-register as a single critical section, so
//! two concurrent requests for the same key can never both become owners.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::debug;

use super::fingerprint::DedupKey;
use crate::channels::DeliveryReceipt;
use crate::error::DeliveryError;

/// Final result of one owned send, broadcast to attached requests.
pub type SendResult = Result<DeliveryReceipt, DeliveryError>;

/// Completed send kept for the duplicate window.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub sent_at: DateTime<Utc>,
    pub attempts: u32,
}

struct InFlight {
    ticket: u64,
    /// Start of the send, advanced each time a chunk is acknowledged.
    active_at: DateTime<Utc>,
    rx: watch::Receiver<Option<SendResult>>,
}

/// Handed to the request that performs the send.
pub struct SendTicket {
    pub key: DedupKey,
    pub id: u64,
    pub tx: watch::Sender<Option<SendResult>>,
}

pub enum Begin {
    /// Same content already reached this recipient within the window.
    Duplicate(SentRecord),
    /// An identical send is in progress; wait on its result.
    Attach(watch::Receiver<Option<SendResult>>),
    /// Caller owns the send and must call [`SendRegistry::complete`].
    Owner(SendTicket),
}

#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub duplicate_window: Duration,
    /// In-flight entries older than this are presumed dead and replaced.
    pub stale_after: Duration,
    pub max_sent: usize,
    pub sent_eviction_fraction: f64,
    pub max_in_flight: usize,
    pub in_flight_eviction_fraction: f64,
}

struct Inner {
    sent: HashMap<DedupKey, SentRecord>,
    in_flight: HashMap<DedupKey, InFlight>,
    next_ticket: u64,
}

pub struct SendRegistry {
    inner: Mutex<Inner>,
    limits: RegistryLimits,
    duplicate_window: chrono::Duration,
    stale_after: chrono::Duration,
}

impl SendRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sent: HashMap::new(),
                in_flight: HashMap::new(),
                next_ticket: 0,
            }),
            duplicate_window: to_chrono(limits.duplicate_window),
            stale_after: to_chrono(limits.stale_after),
            limits,
        }
    }

    pub async fn begin(&self, key: DedupKey, now: DateTime<Utc>) -> Begin {
        let mut inner = self.inner.lock().await;

        if let Some(record) = inner.sent.get(&key) {
            if now - record.sent_at < self.duplicate_window {
                return Begin::Duplicate(record.clone());
            }
            inner.sent.remove(&key);
        }

        if let Some(flight) = inner.in_flight.get(&key) {
            // A closed channel means the owner went away without reporting.
            let alive = flight.rx.has_changed().is_ok() || flight.rx.borrow().is_some();
            if alive && now - flight.active_at < self.stale_after {
                return Begin::Attach(flight.rx.clone());
            }
            debug!(key = %key, "Replacing stale in-flight send");
            inner.in_flight.remove(&key);
        }

        if inner.in_flight.len() >= self.limits.max_in_flight {
            let evicted = evict_oldest(
                &mut inner.in_flight,
                self.limits.in_flight_eviction_fraction,
                |f| f.active_at,
            );
            debug!(evicted, "In-flight registry at capacity");
        }

        inner.next_ticket += 1;
        let id = inner.next_ticket;
        let (tx, rx) = watch::channel(None);
        inner.in_flight.insert(
            key.clone(),
            InFlight {
                ticket: id,
                active_at: now,
                rx,
            },
        );
        Begin::Owner(SendTicket { key, id, tx })
    }

    /// Note progress on a multi-chunk send so it is not mistaken for stale.
    pub async fn touch(&self, ticket: &SendTicket, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(flight) = inner
            .in_flight
            .get_mut(&ticket.key)
            .filter(|f| f.ticket == ticket.id)
        {
            flight.active_at = now;
        }
    }

    /// Release the in-flight slot and, on success, remember the send.
    /// Failed sends leave no record, so the key can be retried.
    pub async fn complete(&self, ticket: &SendTicket, sent: Option<SentRecord>) {
        let mut inner = self.inner.lock().await;
        if inner
            .in_flight
            .get(&ticket.key)
            .is_some_and(|f| f.ticket == ticket.id)
        {
            inner.in_flight.remove(&ticket.key);
        }

        let Some(record) = sent else {
            return;
        };
        if !inner.sent.contains_key(&ticket.key) && inner.sent.len() >= self.limits.max_sent {
            let evicted = evict_oldest(
                &mut inner.sent,
                self.limits.sent_eviction_fraction,
                |r| r.sent_at,
            );
            debug!(evicted, "Sent history at capacity");
        }
        inner.sent.insert(ticket.key.clone(), record);
    }

    /// Drop expired sent records and stale in-flight entries.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.sent.len() + inner.in_flight.len();
        inner
            .sent
            .retain(|_, r| now - r.sent_at < self.duplicate_window);
        inner
            .in_flight
            .retain(|_, f| now - f.active_at < self.stale_after);
        before - (inner.sent.len() + inner.in_flight.len())
    }

    pub async fn sent_len(&self) -> usize {
        self.inner.lock().await.sent.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }
}

/// Remove `ceil(len * fraction)` entries (at least one), oldest first.
fn evict_oldest<V>(
    map: &mut HashMap<DedupKey, V>,
    fraction: f64,
    age: impl Fn(&V) -> DateTime<Utc>,
) -> usize {
    let count = ((map.len() as f64 * fraction).ceil() as usize).clamp(1, map.len().max(1));
    let mut by_age: Vec<(DateTime<Utc>, DedupKey)> =
        map.iter().map(|(k, v)| (age(v), k.clone())).collect();
    by_age.sort_by_key(|(at, _)| *at);
    let mut removed = 0;
    for (_, key) in by_age.into_iter().take(count) {
        if map.remove(&key).is_some() {
            removed += 1;
        }
    }
    removed
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_sent: usize, max_in_flight: usize) -> RegistryLimits {
        RegistryLimits {
            duplicate_window: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            max_sent,
            sent_eviction_fraction: 0.2,
            max_in_flight,
            in_flight_eviction_fraction: 0.5,
        }
    }

    fn key(n: usize) -> DedupKey {
        DedupKey::new(&format!("r{n}"), "hello", 500)
    }

    fn owner(begin: Begin) -> SendTicket {
        match begin {
            Begin::Owner(t) => t,
            _ => panic!("expected owner"),
        }
    }

    fn record(at: DateTime<Utc>) -> Option<SentRecord> {
        Some(SentRecord {
            sent_at: at,
            attempts: 1,
        })
    }

    #[tokio::test]
    async fn second_begin_attaches_while_in_flight() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let _ticket = owner(reg.begin(key(1), now).await);
        assert!(matches!(reg.begin(key(1), now).await, Begin::Attach(_)));
    }

    #[tokio::test]
    async fn completed_send_is_duplicate_within_window() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let ticket = owner(reg.begin(key(1), now).await);
        reg.complete(&ticket, record(now)).await;

        assert!(matches!(reg.begin(key(1), now).await, Begin::Duplicate(_)));
        let later = now + chrono::Duration::seconds(31);
        assert!(matches!(reg.begin(key(1), later).await, Begin::Owner(_)));
    }

    #[tokio::test]
    async fn failed_send_releases_key() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let ticket = owner(reg.begin(key(1), now).await);
        reg.complete(&ticket, None).await;
        assert_eq!(reg.in_flight_len().await, 0);
        assert!(matches!(reg.begin(key(1), now).await, Begin::Owner(_)));
    }

    #[tokio::test]
    async fn dropped_owner_is_replaced() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        drop(owner(reg.begin(key(1), now).await));
        assert!(matches!(reg.begin(key(1), now).await, Begin::Owner(_)));
    }

    #[tokio::test]
    async fn stale_in_flight_is_replaced() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let _ticket = owner(reg.begin(key(1), now).await);
        let later = now + chrono::Duration::seconds(61);
        assert!(matches!(reg.begin(key(1), later).await, Begin::Owner(_)));
    }

    #[tokio::test]
    async fn progress_keeps_a_long_send_alive() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let ticket = owner(reg.begin(key(1), now).await);
        reg.touch(&ticket, now + chrono::Duration::seconds(50)).await;
        let later = now + chrono::Duration::seconds(61);
        assert!(matches!(reg.begin(key(1), later).await, Begin::Attach(_)));
    }

    #[tokio::test]
    async fn sent_history_evicts_a_fifth_oldest() {
        let reg = SendRegistry::new(limits(10, 100));
        let t0 = Utc::now();
        for n in 0..10 {
            let at = t0 + chrono::Duration::milliseconds(n as i64);
            let ticket = owner(reg.begin(key(n), at).await);
            reg.complete(&ticket, record(at)).await;
        }
        assert_eq!(reg.sent_len().await, 10);

        let ticket = owner(reg.begin(key(10), t0).await);
        reg.complete(&ticket, record(t0 + chrono::Duration::seconds(1))).await;
        // 2 oldest evicted, 1 added.
        assert_eq!(reg.sent_len().await, 9);
        assert!(matches!(reg.begin(key(0), t0).await, Begin::Owner(_)));
        assert!(matches!(reg.begin(key(9), t0).await, Begin::Duplicate(_)));
    }

    #[tokio::test]
    async fn in_flight_evicts_half_oldest() {
        let reg = SendRegistry::new(limits(100, 4));
        let t0 = Utc::now();
        let mut tickets = Vec::new();
        for n in 0..4 {
            let at = t0 + chrono::Duration::milliseconds(n as i64);
            tickets.push(owner(reg.begin(key(n), at).await));
        }
        tickets.push(owner(reg.begin(key(4), t0).await));
        assert_eq!(reg.in_flight_len().await, 3);

        // An evicted owner can still complete; it just records the send.
        reg.complete(&tickets[0], record(t0)).await;
        assert_eq!(reg.in_flight_len().await, 3);
        assert!(matches!(reg.begin(key(0), t0).await, Begin::Duplicate(_)));
    }

    #[tokio::test]
    async fn sweep_drops_expired_records() {
        let reg = SendRegistry::new(limits(10, 10));
        let now = Utc::now();
        let ticket = owner(reg.begin(key(1), now).await);
        reg.complete(&ticket, record(now)).await;
        let _pending = owner(reg.begin(key(2), now).await);
        assert_eq!(reg.sweep(now + chrono::Duration::seconds(120)).await, 2);
    }
}
