use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::record::{IdempotencyRecord, RecordStatus};

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.get_hits();
        let total = hits + self.get_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Process-local LRU of completed idempotency records.
///
/// Purely an optimization in front of the authoritative store: only completed
/// records are admitted, never in-progress state, which is cross-process and
/// must come from the store. All operations are synchronous.
pub struct LocalCache {
    entries: Mutex<LruCache<String, IdempotencyRecord>>,
    stats: Arc<CacheStats>,
}

impl LocalCache {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    /// Looks up a record, refreshing its recency. Expired entries are dropped
    /// on read and reported as misses.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(record) if !record.is_expired(now) => {
                let record = record.clone();
                self.stats.record_hit();
                Some(record)
            }
            Some(_) => {
                entries.pop(key);
                self.stats.record_miss();
                None
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Inserts or refreshes a completed record, evicting the least-recently
    /// used entry at capacity. Non-completed records are refused.
    pub fn set(&self, record: IdempotencyRecord) {
        if record.status != RecordStatus::Completed {
            return;
        }

        let mut entries = self.entries.lock().unwrap();
        if entries.len() == entries.cap().get() && !entries.contains(&record.idempotency_key) {
            self.stats.record_eviction();
        }
        entries.put(record.idempotency_key.clone(), record);
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
