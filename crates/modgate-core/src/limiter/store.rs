use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::ControlResult;

/// Counter value after an increment, with the time left before it resets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterSnapshot {
    pub count: u64,
    pub ttl_remaining: Duration,
}

/// Key-value counters with INCR+EXPIRE semantics.
///
/// `increment` creates a missing or expired counter at 1 with a TTL of
/// `window`; later increments inside the window keep the original expiry.
pub trait CounterStore: Send + Sync {
    fn increment(&self, key: &str, window: Duration) -> ControlResult<CounterSnapshot>;

    fn peek(&self, key: &str) -> ControlResult<Option<CounterSnapshot>>;
}

/// Table size below which `increment` never sweeps expired counters.
const MIN_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct CounterTable {
    counters: HashMap<String, Counter>,
    sweep_threshold: usize,
}

impl Default for CounterTable {
    fn default() -> Self {
        Self {
            counters: HashMap::new(),
            sweep_threshold: MIN_SWEEP_THRESHOLD,
        }
    }
}

impl CounterTable {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at > now);
        self.sweep_threshold = MIN_SWEEP_THRESHOLD.max(self.counters.len() * 2);
        before - self.counters.len()
    }
}

/// Process-local store used when no shared backend is configured.
///
/// Expired counters are swept whenever the table reaches twice its size
/// after the previous sweep, so it stays proportional to the live keys.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    table: Mutex<CounterTable>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired counters and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().counters.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, CounterTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(&self, key: &str, window: Duration) -> ControlResult<CounterSnapshot> {
        let now = Instant::now();
        let mut table = self.lock();
        if table.counters.len() >= table.sweep_threshold && !table.counters.contains_key(key) {
            let purged = table.purge_expired(now);
            tracing::trace!(
                purged,
                live = table.counters.len(),
                "swept expired rate limit counters"
            );
        }
        let counter = table.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + window,
        });
        if counter.expires_at <= now {
            counter.count = 0;
            counter.expires_at = now + window;
        }
        counter.count += 1;
        Ok(CounterSnapshot {
            count: counter.count,
            ttl_remaining: counter.expires_at.saturating_duration_since(now),
        })
    }

    fn peek(&self, key: &str) -> ControlResult<Option<CounterSnapshot>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .counters
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| CounterSnapshot {
                count: counter.count,
                ttl_remaining: counter.expires_at.saturating_duration_since(now),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_share_the_first_expiry() {
        let store = InMemoryCounterStore::new();
        let first = store.increment("k", Duration::from_secs(10)).unwrap();
        let second = store.increment("k", Duration::from_secs(10)).unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.ttl_remaining <= first.ttl_remaining);
    }

    #[test]
    fn expired_counters_restart_and_purge() {
        let store = InMemoryCounterStore::new();
        store.increment("k", Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(store.peek("k").unwrap(), None);
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
        assert_eq!(store.increment("k", Duration::from_secs(1)).unwrap().count, 1);
    }

    #[test]
    fn table_is_swept_as_new_keys_arrive() {
        let store = InMemoryCounterStore::new();
        let window = Duration::from_millis(5);
        for round in 0..3 {
            for ip in 0..1000 {
                store.increment(&format!("{round}:10.0.{}.{}", ip / 256, ip % 256), window).unwrap();
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let held = store.len();
        assert!(held <= MIN_SWEEP_THRESHOLD, "table held {held} counters");
        assert_eq!(store.purge_expired(), held);
        assert!(store.is_empty());
    }

    #[test]
    fn live_counters_survive_a_sweep() {
        let store = InMemoryCounterStore::new();
        store.increment("live", Duration::from_secs(60)).unwrap();
        for key in 1..MIN_SWEEP_THRESHOLD {
            store.increment(&format!("short-{key}"), Duration::from_millis(200)).unwrap();
        }
        assert_eq!(store.len(), MIN_SWEEP_THRESHOLD);
        std::thread::sleep(Duration::from_millis(250));
        store.increment("fresh", Duration::from_secs(60)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.increment("live", Duration::from_secs(60)).unwrap().count, 2);
    }
}
