//! Short-lived TTL cache for decoded remote objects.
//!
//! One instance is owned by the fetch client and handed around by `Arc`; there
//! is no process-wide state. The cache is purely an optimisation: a poisoned
//! lock or an expired entry is reported as a miss and the caller fetches live.
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Deterministic fingerprint of `(operation, object id, variant)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: &'static str,
    pub object_id: String,
    pub fingerprint: u64,
}

impl CacheKey {
    pub fn new(operation: &'static str, object_id: &str, variant: impl Hash) -> Self {
        let mut hasher = DefaultHasher::new();
        variant.hash(&mut hasher);
        Self {
            operation,
            object_id: object_id.to_string(),
            fingerprint: hasher.finish(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:016x}",
            self.operation, self.object_id, self.fingerprint
        )
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct TtlCache<V> {
    entries: RwLock<HashMap<CacheKey, Entry<V>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let found = self.entries.read().ok().and_then(|entries| {
            entries
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .map(|entry| entry.value.clone())
        });
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Replace the value stored under `key`. Entries are never mutated in place.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key,
                Entry {
                    value,
                    inserted_at: Instant::now(),
                    ttl,
                },
            );
        }
    }

    pub fn put(&self, key: CacheKey, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Drop every entry belonging to `object_id`, whatever the operation.
    pub fn invalidate_scope(&self, object_id: &str) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, _| key.object_id != object_id);
        before - entries.len()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let entries = self.entries.read().map(|e| e.len()).unwrap_or(0);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            entries,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
