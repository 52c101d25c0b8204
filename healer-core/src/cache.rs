//! Timestamped response cache backing the stale-cache degradation path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::clock::{Clock, system_clock};

/// Default freshness window for stale-cache fallback: 5 minutes.
pub const DEFAULT_STALE_TTL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
struct Entry {
    data: Value,
    cached_at_ms: u64,
}

/// Process-wide key → payload store with lazy eviction.
pub struct ResponseCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The shared process-wide cache.
    pub fn global() -> Arc<ResponseCache> {
        static GLOBAL: Lazy<Arc<ResponseCache>> =
            Lazy::new(|| Arc::new(ResponseCache::new(system_clock())));
        GLOBAL.clone()
    }

    /// Stores `data` under `key`, stamped with the current time.
    pub fn remember(&self, key: &str, data: Value) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().expect("response cache poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                data,
                cached_at_ms: now,
            },
        );
    }

    /// Returns the cached payload iff it is younger than `ttl_ms`.
    ///
    /// A non-positive ttl disables the freshness check. Entries older than
    /// the ttl are evicted on the failed read.
    pub fn recall(&self, key: &str, ttl_ms: i64) -> Option<Value> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().expect("response cache poisoned");
        let entry = entries.get(key)?;
        if ttl_ms <= 0 || now.saturating_sub(entry.cached_at_ms) <= ttl_ms as u64 {
            return Some(entry.data.clone());
        }
        entries.remove(key);
        None
    }
}
