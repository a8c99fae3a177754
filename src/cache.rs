//! Cache manager
//!
//! Bounded in-memory store keyed by opaque strings (by convention
//! `<table>_<id>` or `<table>_<query fingerprint>`). Entries carry a TTL
//! and a dirty bit; dirty entries are the write-back set of the auto-sync
//! service and are never evicted. Capacity is bounded both by entry count
//! and by estimated memory (serialized JSON length).
//!
//! The three classic cache failure modes are each addressed:
//! - penetration: a load that finds nothing caches a short-lived null
//!   guard, so repeated misses for the same key short-circuit;
//! - breakdown: concurrent loads of one key coalesce behind a single
//!   in-flight loader;
//! - avalanche: every TTL gets random jitter so entries set together do
//!   not expire together.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::error::{ErrorCode, Result, StoreError};
use crate::types::estimate_size;

/// Which entry to sacrifice under capacity pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Least recently used (default)
    Lru,
    /// Least frequently used
    Lfu,
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::Lru
    }
}

/// Cache tuning knobs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// TTL applied when `set` is called without one
    pub default_expiry: Duration,
    /// Upper bound on estimated memory (serialized bytes)
    pub max_memory_usage: usize,
    /// Fraction of `max_memory_usage` at which proactive eviction starts
    pub memory_threshold: f64,
    /// Up to this much random jitter is added to every TTL
    pub avalanche_jitter: Duration,
    /// TTL for penetration null guards
    pub null_guard_expiry: Duration,
    pub penetration_protection: bool,
    pub breakdown_protection: bool,
    pub avalanche_protection: bool,
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_expiry: Duration::from_secs(300),
            max_memory_usage: 64 * 1024 * 1024,
            memory_threshold: 0.8,
            avalanche_jitter: Duration::from_secs(30),
            null_guard_expiry: Duration::from_secs(5),
            penetration_protection: true,
            breakdown_protection: true,
            avalanche_protection: true,
            strategy: EvictionStrategy::Lru,
        }
    }
}

/// Counters exposed by [`CacheManager::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub penetration_blocks: u64,
}

struct Entry {
    value: Value,
    expires_at: Instant,
    dirty: bool,
    /// Serialized-length estimate, for memory accounting
    size: usize,
    /// Monotonic access tick, for LRU
    last_access: u64,
    /// Access count, for LFU
    hits: u64,
    /// Penetration guard marker
    null_guard: bool,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    total_size: usize,
    tick: u64,
    stats: CacheStats,
}

/// Callback invoked when eviction finds only dirty entries. The auto-sync
/// service registers its drain here; the cache itself knows nothing about
/// the engine.
pub type FlushHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

pub struct CacheManager {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    /// Keys with a loader in flight (breakdown protection)
    inflight: Mutex<HashSet<String>>,
    inflight_done: Condvar,
    flush_hook: RwLock<Option<FlushHook>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_size: 0,
                tick: 0,
                stats: CacheStats::default(),
            }),
            inflight: Mutex::new(HashSet::new()),
            inflight_done: Condvar::new(),
            flush_hook: RwLock::new(None),
        }
    }

    /// Register the drain used when only dirty entries block eviction
    pub fn set_flush_hook(&self, hook: FlushHook) {
        *self.flush_hook.write().expect("flush hook lock poisoned") = Some(hook);
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        if !self.config.avalanche_protection || self.config.avalanche_jitter.is_zero() {
            return ttl;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.config.avalanche_jitter.as_millis() as u64);
        ttl + Duration::from_millis(jitter_ms)
    }

    /// Insert or replace an entry. Fails only when capacity is exhausted
    /// by dirty entries and the flush hook cannot free room.
    pub fn set(&self, key: &str, value: Value, expiry: Option<Duration>, dirty: bool) -> Result<()> {
        self.set_entry(key, value, expiry, dirty, false)
    }

    fn set_entry(
        &self,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
        dirty: bool,
        null_guard: bool,
    ) -> Result<()> {
        let ttl = self.jittered(expiry.unwrap_or(self.config.default_expiry));
        let size = estimate_size(&value);

        let evicted_all = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            inner.stats.sets += 1;

            if let Some(old) = inner.entries.remove(key) {
                inner.total_size -= old.size;
            }
            self.make_room(&mut inner, size)
        };

        if !evicted_all {
            // Only dirty entries left: drain once through the hook, retry.
            self.run_flush_hook()?;
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            if !self.make_room(&mut inner, size) {
                return Err(StoreError::new(
                    ErrorCode::DataIncomplete,
                    "cache is full of dirty entries and the flush hook could not free room",
                )
                .with_details(format!("key '{}'", key))
                .with_suggestion("lower the write rate or raise the cache capacity"));
            }
            inner.tick += 1;
            let tick = inner.tick;
            inner.total_size += size;
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                    dirty,
                    size,
                    last_access: tick,
                    hits: 0,
                    null_guard,
                },
            );
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.total_size += size;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                dirty,
                size,
                last_access: tick,
                hits: 0,
                null_guard,
            },
        );
        Ok(())
    }

    fn run_flush_hook(&self) -> Result<()> {
        let hook = self.flush_hook.read().expect("flush hook lock poisoned");
        match hook.as_ref() {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    /// Evict until `extra` bytes and one entry slot fit. Returns false
    /// when the remaining entries are all dirty and room is still short.
    fn make_room(&self, inner: &mut CacheInner, extra: usize) -> bool {
        let memory_limit = self.config.max_memory_usage;
        let proactive_limit = (memory_limit as f64 * self.config.memory_threshold) as usize;

        loop {
            let over_count = inner.entries.len() + 1 > self.config.max_size;
            let over_memory = inner.total_size + extra > memory_limit;
            let over_threshold = inner.total_size + extra > proactive_limit;

            if !over_count && !over_memory && !over_threshold {
                return true;
            }
            // The proactive threshold trims opportunistically but never
            // fails a set on its own.
            if !over_count && !over_memory {
                if !self.evict_one(inner) {
                    return true;
                }
                continue;
            }
            if !self.evict_one(inner) {
                return false;
            }
        }
    }

    /// Evict one clean entry per the configured strategy; expired entries
    /// go first regardless of strategy.
    fn evict_one(&self, inner: &mut CacheInner) -> bool {
        let now = Instant::now();

        if let Some(key) = inner
            .entries
            .iter()
            .find(|(_, e)| !e.dirty && e.expires_at <= now)
            .map(|(k, _)| k.clone())
        {
            let entry = inner.entries.remove(&key).expect("entry vanished");
            inner.total_size -= entry.size;
            inner.stats.expirations += 1;
            return true;
        }

        let victim = match self.config.strategy {
            EvictionStrategy::Lru => inner
                .entries
                .iter()
                .filter(|(_, e)| !e.dirty)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Lfu => inner
                .entries
                .iter()
                .filter(|(_, e)| !e.dirty)
                .min_by_key(|(_, e)| (e.hits, e.last_access))
                .map(|(k, _)| k.clone()),
        };

        match victim {
            Some(key) => {
                let entry = inner.entries.remove(&key).expect("entry vanished");
                inner.total_size -= entry.size;
                inner.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    /// Fetch a value, honoring TTLs. A penetration null guard reads as a
    /// hit on `Value::Null`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            let entry = inner.entries.remove(key).expect("entry vanished");
            inner.total_size -= entry.size;
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        let entry = inner.entries.get_mut(key).expect("entry vanished");
        entry.last_access = tick;
        entry.hits += 1;
        let value = entry.value.clone();
        if entry.null_guard {
            inner.stats.penetration_blocks += 1;
        }
        inner.stats.hits += 1;
        Some(value)
    }

    /// Whether a live entry exists (does not touch access stats)
    pub fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .get(key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Remove an entry outright, dirty or not
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.total_size -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Remove an entry unless it is dirty. Invalidation uses this so a
    /// pending write-back entry can never be dropped by a racing read-key
    /// sweep.
    pub fn invalidate_clean(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let dirty = inner.entries.get(key).map(|e| e.dirty).unwrap_or(false);
        if dirty {
            return false;
        }
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.total_size -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Drop everything, including dirty entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.total_size = 0;
    }

    /// Snapshot of the dirty entries (the auto-sync flush set)
    pub fn dirty_data(&self) -> Vec<(String, Value)> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Clear the dirty bit, but only when the entry still holds the value
    /// that was flushed; a write that landed mid-flush keeps its dirty bit.
    pub fn mark_clean(&self, key: &str, flushed_value: &Value) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.dirty && &entry.value == flushed_value {
                entry.dirty = false;
            }
        }
    }

    /// Bulk variant of [`mark_clean`]
    pub fn mark_clean_bulk(&self, flushed: &[(String, Value)]) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        for (key, flushed_value) in flushed {
            if let Some(entry) = inner.entries.get_mut(key) {
                if entry.dirty && &entry.value == flushed_value {
                    entry.dirty = false;
                }
            }
        }
    }

    /// Live entry count (expired entries still waiting for harvest count)
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated memory footprint in bytes
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").total_size
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock poisoned").stats
    }

    /// Fetch through the cache: return a hit, otherwise run `loader` and
    /// cache its result. Concurrent misses for one key coalesce — only one
    /// loader runs, the rest wait and re-check (breakdown protection). A
    /// `None` from the loader is cached as a short-lived null guard
    /// (penetration protection).
    pub fn get_or_load<F>(&self, key: &str, expiry: Option<Duration>, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Result<Option<Value>>,
    {
        loop {
            if let Some(value) = self.get(key) {
                if value.is_null() {
                    return Ok(None);
                }
                return Ok(Some(value));
            }

            if !self.config.breakdown_protection {
                return self.load_and_store(key, expiry, loader);
            }

            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            if inflight.contains(key) {
                // Someone else is loading this key; wait and re-check.
                let _unused = self
                    .inflight_done
                    .wait_timeout(inflight, Duration::from_secs(10))
                    .expect("inflight lock poisoned");
                continue;
            }
            inflight.insert(key.to_string());
            drop(inflight);

            let result = self.load_and_store(key, expiry, loader);

            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.remove(key);
            self.inflight_done.notify_all();
            return result;
        }
    }

    fn load_and_store<F>(&self, key: &str, expiry: Option<Duration>, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Result<Option<Value>>,
    {
        match loader()? {
            Some(value) => {
                self.set(key, value.clone(), expiry, false)?;
                Ok(Some(value))
            }
            None => {
                if self.config.penetration_protection {
                    self.set_entry(
                        key,
                        Value::Null,
                        Some(self.config.null_guard_expiry),
                        false,
                        true,
                    )?;
                }
                Ok(None)
            }
        }
    }
}
