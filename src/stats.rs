//! Operation counters
//!
//! Lock-free counters owned by the store and reported over `/stats`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreStats {
    sets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
    queries: AtomicU64,
}

/// Point-in-time view of the counters, serializable for the API.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sets: u64,
    pub hits: u64,
    pub misses: u64,
    pub deletes: u64,
    pub expired: u64,
    pub queries: u64,
    pub live_entries: usize,
    pub hit_rate: f64,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, live_entries: usize) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        StatsSnapshot {
            sets: self.sets.load(Ordering::Relaxed),
            hits,
            misses,
            deletes: self.deletes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            live_entries,
            hit_rate,
        }
    }
}
