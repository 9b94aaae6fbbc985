//! Fingerprint-keyed result cache.
//!
//! Entries expire after their TTL and, when a capacity is set, the least
//! recently used entry is evicted on overflow. The cache guards its own
//! state with a mutex so parallel invocations can share one instance.
//! Expiry uses `tokio::time::Instant`, so it follows paused test clocks.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::Fingerprint;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct ResultCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    default_ttl: Duration,
}

impl ResultCache {
    /// Create a cache. `capacity` of `None` keeps entries until they expire.
    pub fn new(capacity: Option<NonZeroUsize>, default_ttl: Duration) -> Self {
        let entries = match capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. Expired entries are dropped on the way out.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(fingerprint) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(fingerprint);
                tracing::debug!(fingerprint = %fingerprint.short(), "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Store `value` for `ttl`, replacing any previous entry.
    pub fn put(&self, fingerprint: Fingerprint, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        if let Some((evicted, _)) = self.lock().push(fingerprint.clone(), entry) {
            if evicted != fingerprint {
                tracing::debug!(fingerprint = %evicted.short(), "cache entry evicted");
            }
        }
    }

    /// Store `value` with the cache's default TTL.
    pub fn insert(&self, fingerprint: Fingerprint, value: Value) {
        self.put(fingerprint, value, self.default_ttl);
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().pop(fingerprint).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Entries currently held, including any not yet noticed as expired.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("len", &self.len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}
