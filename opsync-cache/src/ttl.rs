//! In-memory read cache with read-time TTL.
//!
//! The cache does not store a ttl. Each reader says how old a value may be;
//! a read is a hit only if the ttl is non-zero and the entry was written no
//! longer than `ttl` ago. Expired entries are removed by the read that
//! notices them.

use dashmap::DashMap;
use regex::Regex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A cached value with its write time.
#[derive(Clone)]
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    written_at: Instant,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (absent, expired or wrong type).
    pub misses: u64,
    /// Entries removed because a read found them expired.
    pub expirations: u64,
    /// Entries removed by key, pattern or clear.
    pub invalidations: u64,
    /// Number of entries currently in cache.
    pub entry_count: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Shared TTL cache handle. Clones share the same entries.
#[derive(Clone, Default)]
pub struct TtlCache {
    inner: Arc<Inner>,
}

enum Lookup {
    Absent,
    Expired(Instant),
    Present(Arc<dyn Any + Send + Sync>),
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `key` if it was written no longer than `ttl` ago.
    ///
    /// A zero ttl always misses. A value stored under a different type is a
    /// miss and stays in place.
    pub fn get<T>(&self, key: impl AsRef<str>, ttl: Duration) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = key.as_ref();
        if ttl.is_zero() {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let now = Instant::now();

        let lookup = match self.inner.entries.get(key) {
            None => Lookup::Absent,
            Some(entry) => {
                if now.saturating_duration_since(entry.written_at) > ttl {
                    Lookup::Expired(entry.written_at)
                } else {
                    Lookup::Present(entry.value.clone())
                }
            }
        };

        match lookup {
            Lookup::Present(value) => match value.downcast_ref::<T>() {
                Some(hit) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = key, "cache hit");
                    Some(hit.clone())
                }
                None => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key = key, "cache entry has a different type");
                    None
                }
            },
            Lookup::Expired(written_at) => {
                // Only drop the entry we judged stale, not a concurrent rewrite.
                if self
                    .inner
                    .entries
                    .remove_if(key, |_, entry| entry.written_at == written_at)
                    .is_some()
                {
                    self.inner.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = key, "cache entry expired");
                None
            }
            Lookup::Absent => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = key, "cache miss");
                None
            }
        }
    }

    /// Store `value` under `key`, overwriting and resetting its write time.
    pub fn set<T>(&self, key: impl AsRef<str>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let key = key.as_ref();
        self.inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                written_at: Instant::now(),
            },
        );
        debug!(key = key, "cache set");
    }

    /// Remove one entry. No-op if absent.
    pub fn invalidate(&self, key: impl AsRef<str>) {
        if self.inner.entries.remove(key.as_ref()).is_some() {
            self.inner.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every key matching a glob where `*` matches any run of
    /// characters. Returns the number of entries removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = match glob_to_regex(pattern) {
            Ok(matcher) => matcher,
            Err(err) => {
                warn!(pattern = pattern, error = %err, "invalid cache pattern");
                return 0;
            }
        };

        let mut removed = 0usize;
        self.inner.entries.retain(|key, _| {
            if matcher.is_match(key) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.inner
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(pattern = pattern, count = removed, "invalidated cache entries");
        }
        removed
    }

    /// Empty the cache.
    pub fn clear(&self) {
        let count = self.inner.entries.len();
        self.inner.entries.clear();
        self.inner
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
        info!(count = count, "cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
            invalidations: self.inner.invalidations.load(Ordering::Relaxed),
            entry_count: self.inner.entries.len(),
        }
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}
