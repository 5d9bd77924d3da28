//! In-memory TTL cache placed in front of the store reads.
//!
//! Entries expire lazily: nothing sweeps the map in the background, an
//! expired entry is evicted the moment someone looks it up (and counted as a
//! miss), or when it is invalidated. Every operation, prefix scans included,
//! runs inside a single lock so readers never see a half-invalidated view.
//!
//! Every invalidation bumps a generation counter. A cache-through load that
//! overlapped an invalidation returns what it loaded but does not store it,
//! so a value read before a job finished can never repopulate the cache
//! after the job invalidated it.
//!
//! Time is read from [`tokio::time::Instant`] so tests can pause and advance
//! the clock.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AppResult;

/// Cache key builders. Every key the application uses is built here.
pub mod keys {
    use chrono::NaiveDate;

    pub const ARTICLES_PREFIX: &str = "articles:";
    pub const TRANSCRIPTIONS_PREFIX: &str = "transcriptions:";
    pub const DIGEST_PREFIX: &str = "digest:";
    pub const DASHBOARD_PREFIX: &str = "dashboard:";

    pub fn articles(date: NaiveDate) -> String {
        format!("{ARTICLES_PREFIX}{date}")
    }

    pub fn transcriptions(date: NaiveDate) -> String {
        format!("{TRANSCRIPTIONS_PREFIX}{date}")
    }

    pub fn digest(date: NaiveDate) -> String {
        format!("{DIGEST_PREFIX}{date}")
    }

    pub fn dashboard_stats() -> String {
        format!("{DASHBOARD_PREFIX}stats")
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.created_at + self.ttl
    }
}

/// Counters reported to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub valid_keys: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Incremented by every invalidation.
    generation: u64,
}

#[derive(Debug, Default)]
pub struct CacheStore {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry. Expired entries are dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let found = match state.entries.get(key) {
            Some(entry) if entry.is_valid(now) => Some(entry.value.clone()),
            Some(_) => {
                state.entries.remove(key);
                debug!(key, "Evicted expired cache entry");
                None
            }
            None => None,
        };
        drop(state);

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

    /// Store `value` under `key`, replacing any previous entry and its age.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
        };
        self.state.lock().entries.insert(key.into(), entry);
    }

    /// Store `value` only if no invalidation happened since `generation` was
    /// read. Returns whether the value was stored.
    fn set_if_current(&self, key: &str, value: Value, ttl: Duration, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(key, "Invalidated while loading; not caching");
            return false;
        }
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Remove a single key, or every key sharing a prefix.
    ///
    /// A pattern ending in `*` or `:` is treated as a prefix (`articles:*`
    /// and `articles:` are equivalent). Returns how many entries were removed.
    pub fn invalidate(&self, key_or_prefix: &str) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let removed = if key_or_prefix.ends_with('*') || key_or_prefix.ends_with(':') {
            let prefix = key_or_prefix.trim_end_matches('*');
            let before = state.entries.len();
            state.entries.retain(|key, _| !key.starts_with(prefix));
            before - state.entries.len()
        } else {
            usize::from(state.entries.remove(key_or_prefix).is_some())
        };
        drop(state);

        debug!(pattern = key_or_prefix, removed, "Invalidated cache entries");
        removed
    }

    /// Drop every entry. Counters are kept.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let valid_keys = self
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.is_valid(now))
            .count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            valid_keys,
            hit_ratio,
        }
    }

    /// Typed read. A payload that no longer matches `T` is dropped and
    /// treated as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "Cached payload has an unexpected shape; dropping it");
                self.invalidate(key);
                None
            }
        }
    }

    /// Cache-through read: serve from the cache on a hit, otherwise run
    /// `loader`, populate the cache with `ttl` and return the loaded value.
    ///
    /// # Arguments
    ///
    /// * `key` - Full cache key, e.g. `articles:2025-05-06`
    /// * `ttl` - Lifetime of the entry written on a miss
    /// * `loader` - Reads the value from the backing store
    ///
    /// # Returns
    ///
    /// The cached or loaded value. Loader errors are returned and nothing is
    /// cached. If any invalidation ran while `loader` was in flight, the
    /// loaded value is returned but not cached.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let generation = self.generation();
        if let Some(cached) = self.get_json(key) {
            return Ok(cached);
        }
        let loaded = loader().await?;
        self.set_if_current(key, serde_json::to_value(&loaded)?, ttl, generation);
        Ok(loaded)
    }
}
