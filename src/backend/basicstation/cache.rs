//! Time-bounded correlation caches.
//!
//! Two callers: the downlink path records token→downlink-id mappings so a
//! later `dntxed` ack can carry the original id, and the dispatcher bumps
//! per-gateway packet counters that the stats loop drains each tick.
//! Entries expire after a fixed TTL; a periodic sweep reclaims whatever was
//! never read back.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::lorawan::Eui64;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map with per-entry expiry. Internally synchronised; all operations take
/// `&self`.
pub(crate) struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Remove and return the live value, if any.
    pub fn take(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        entries
            .remove(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value)
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// The four rolling counters tracked per gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Counter {
    Rx,
    RxOk,
    Tx,
    TxOk,
}

/// Snapshot of one gateway's counters, as drained by the stats loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CounterSnapshot {
    pub rx: u32,
    pub rx_ok: u32,
    pub tx: u32,
    pub tx_ok: u32,
}

/// Per-gateway packet counters with TTL eviction. Keys are fully typed so
/// no two call sites can disagree on key formatting.
pub(crate) struct StatsCounters {
    cache: TtlCache<(Eui64, Counter), u32>,
}

impl StatsCounters {
    pub fn new(ttl: Duration) -> Self {
        StatsCounters {
            cache: TtlCache::new(ttl),
        }
    }

    pub fn increment(&self, gateway_id: Eui64, counter: Counter) {
        let mut entries = self.cache.entries.lock();
        let expires_at = Instant::now() + self.cache.ttl;
        entries
            .entry((gateway_id, counter))
            .and_modify(|e| {
                e.value = e.value.saturating_add(1);
                e.expires_at = expires_at;
            })
            .or_insert(Entry {
                value: 1,
                expires_at,
            });
    }

    /// Read-and-delete all four counters for a gateway; absent counters
    /// read as zero.
    pub fn take_snapshot(&self, gateway_id: Eui64) -> CounterSnapshot {
        CounterSnapshot {
            rx: self.cache.take(&(gateway_id, Counter::Rx)).unwrap_or(0),
            rx_ok: self.cache.take(&(gateway_id, Counter::RxOk)).unwrap_or(0),
            tx: self.cache.take(&(gateway_id, Counter::Tx)).unwrap_or(0),
            tx_ok: self.cache.take(&(gateway_id, Counter::TxOk)).unwrap_or(0),
        }
    }

    pub fn sweep(&self) {
        self.cache.sweep();
    }
}
