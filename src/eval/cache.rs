//! Assignment cache.
//!
//! Memoizes stage outcomes per (flag, environment, targeting key, applying
//! criterion) so repeat traffic skips bucketing. Entries are tagged with the
//! snapshot version they were computed against; observing a newer version
//! drops every entry at once.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::matcher::Applicability;
use super::resolution::Resolution;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub flag_key: String,
    pub environment_id: Uuid,
    pub targeting_key: String,
    /// Part of the key because the same caller may send different attributes.
    pub applicability: Applicability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub resolution: Resolution,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheState {
    version: u64,
    entries: LruCache<CacheKey, CacheEntry>,
}

impl CacheState {
    /// Move to `version`, dropping everything when it is newer. Returns false
    /// when `version` is older than what the cache already holds.
    fn observe(&mut self, version: u64) -> bool {
        if version > self.version {
            if !self.entries.is_empty() {
                tracing::debug!(
                    from = self.version,
                    to = version,
                    dropped = self.entries.len(),
                    "invalidating assignment cache"
                );
            }
            self.entries.clear();
            self.version = version;
        }
        version == self.version
    }
}

/// Bounded LRU cache of assignments. A capacity of zero disables it.
pub struct AssignmentCache {
    state: Option<Mutex<CacheState>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AssignmentCache {
    pub fn new(capacity: usize) -> Self {
        let state = NonZeroUsize::new(capacity).map(|cap| {
            Mutex::new(CacheState {
                version: 0,
                entries: LruCache::new(cap),
            })
        });
        Self {
            state,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Look up an entry computed against `version`.
    pub fn get(&self, key: &CacheKey, version: u64) -> Option<Resolution> {
        let state = self.state.as_ref()?;
        let found = {
            let mut state = state.lock();
            if state.observe(version) {
                state
                    .entries
                    .get(key)
                    .filter(|e| e.version == version)
                    .map(|e| e.resolution)
            } else {
                None
            }
        };

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store an entry. Writes computed against a superseded version are dropped.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let mut state = state.lock();
        if state.observe(entry.version) {
            state.entries.put(key, entry);
        }
    }

    pub fn clear(&self) {
        if let Some(state) = self.state.as_ref() {
            state.lock().entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            len: self
                .state
                .as_ref()
                .map(|s| s.lock().entries.len())
                .unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::resolution::Reason;

    fn key(user: &str) -> CacheKey {
        CacheKey {
            flag_key: "PremiumCheckout".into(),
            environment_id: Uuid::nil(),
            targeting_key: user.into(),
            applicability: Applicability::Criterion(0),
        }
    }

    fn entry(version: u64) -> CacheEntry {
        CacheEntry {
            resolution: Resolution::new(true, Reason::Split),
            version,
        }
    }

    #[test]
    fn returns_what_was_stored() {
        let cache = AssignmentCache::new(8);
        assert!(cache.get(&key("a"), 1).is_none());
        cache.put(key("a"), entry(1));
        assert_eq!(cache.get(&key("a"), 1), Some(entry(1).resolution));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 1));
    }

    #[test]
    fn applicability_is_part_of_the_key() {
        let cache = AssignmentCache::new(8);
        cache.put(key("a"), entry(1));
        let other = CacheKey {
            applicability: Applicability::NoneApplies,
            ..key("a")
        };
        assert!(cache.get(&other, 1).is_none());
    }

    #[test]
    fn newer_version_invalidates_everything() {
        let cache = AssignmentCache::new(8);
        cache.put(key("a"), entry(1));
        cache.put(key("b"), entry(1));

        assert!(cache.get(&key("a"), 2).is_none());
        assert_eq!(cache.stats().len, 0);
    }

    #[test]
    fn stale_writes_are_dropped() {
        let cache = AssignmentCache::new(8);
        cache.put(key("a"), entry(2));
        cache.put(key("b"), entry(1));

        assert!(cache.get(&key("b"), 2).is_none());
        assert!(cache.get(&key("a"), 2).is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = AssignmentCache::new(2);
        cache.put(key("a"), entry(1));
        cache.put(key("b"), entry(1));
        cache.get(&key("a"), 1);
        cache.put(key("c"), entry(1));

        assert!(cache.get(&key("a"), 1).is_some());
        assert!(cache.get(&key("b"), 1).is_none());
        assert!(cache.get(&key("c"), 1).is_some());
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = AssignmentCache::disabled();
        assert!(!cache.is_enabled());
        cache.put(key("a"), entry(1));
        assert!(cache.get(&key("a"), 1).is_none());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn concurrent_access_is_safe() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(AssignmentCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let k = key(&format!("user-{}", (t * 31 + i) % 100));
                        cache.put(k.clone(), entry(1));
                        if let Some(r) = cache.get(&k, 1) {
                            assert_eq!(r, entry(1).resolution);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.stats().len <= 64);
    }
}
