//! Derived-key cache
//!
//! PBKDF2 is deliberately slow, so derived `(aes key, hmac key)` pairs are
//! cached, keyed by `(sha256(master key), salt, iterations)` — the master
//! key itself is never stored. Entries expire by age and are evicted LRU
//! under capacity pressure. A janitor thread prunes expired entries in the
//! background; `shutdown` cancels it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// AES-256 key width; the HMAC key matches it
pub const KEY_SIZE: usize = 32;

/// A derived key pair
#[derive(Clone)]
pub struct KeyPair {
    pub aes_key: [u8; KEY_SIZE],
    pub hmac_key: [u8; KEY_SIZE],
}

#[derive(Debug, Clone)]
pub struct KeyCacheConfig {
    pub max_entries: usize,
    /// Entries older than this are dropped even if hot
    pub max_age: Duration,
    /// How often the janitor prunes expired entries
    pub janitor_interval: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 32,
            max_age: Duration::from_secs(600),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

struct CachedPair {
    pair: KeyPair,
    created: Instant,
    last_used: Instant,
}

type CacheKey = (String, String, u32);

struct Inner {
    entries: Mutex<HashMap<CacheKey, CachedPair>>,
    config: KeyCacheConfig,
    shutdown: AtomicBool,
    wake: (Mutex<()>, Condvar),
}

impl Inner {
    fn prune_expired(&self) {
        let mut entries = self.entries.lock().expect("key cache lock poisoned");
        let max_age = self.config.max_age;
        entries.retain(|_, cached| cached.created.elapsed() < max_age);
    }
}

/// Bounded cache of PBKDF2-derived key pairs
pub struct KeyCache {
    inner: Arc<Inner>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl KeyCache {
    pub fn new(config: KeyCacheConfig) -> Self {
        let inner = Arc::new(Inner {
            entries: Mutex::new(HashMap::new()),
            config,
            shutdown: AtomicBool::new(false),
            wake: (Mutex::new(()), Condvar::new()),
        });

        let janitor_inner = Arc::clone(&inner);
        let janitor = thread::spawn(move || loop {
            {
                let (lock, condvar) = &janitor_inner.wake;
                let guard = lock.lock().expect("key cache wake lock poisoned");
                let _ = condvar
                    .wait_timeout(guard, janitor_inner.config.janitor_interval)
                    .expect("key cache wake lock poisoned");
            }
            if janitor_inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            janitor_inner.prune_expired();
        });

        Self {
            inner,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    /// Cache key component for a master key: its digest, never the key
    fn master_fingerprint(master_key: &str) -> String {
        let digest = Sha256::digest(master_key.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Look up a derived pair, or derive it with `derive` and cache it
    pub fn get_or_derive<F>(
        &self,
        master_key: &str,
        salt: &[u8],
        iterations: u32,
        derive: F,
    ) -> crate::error::Result<KeyPair>
    where
        F: FnOnce() -> crate::error::Result<KeyPair>,
    {
        let cache_key = (
            Self::master_fingerprint(master_key),
            base64::encode(salt),
            iterations,
        );

        {
            let mut entries = self.inner.entries.lock().expect("key cache lock poisoned");
            if let Some(cached) = entries.get_mut(&cache_key) {
                if cached.created.elapsed() < self.inner.config.max_age {
                    cached.last_used = Instant::now();
                    return Ok(cached.pair.clone());
                }
                entries.remove(&cache_key);
            }
        }

        let pair = derive()?;

        let mut entries = self.inner.entries.lock().expect("key cache lock poisoned");
        if entries.len() >= self.inner.config.max_entries {
            // LRU: drop the least recently used entry.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&victim);
            }
        }
        let now = Instant::now();
        entries.insert(
            cache_key,
            CachedPair {
                pair: pair.clone(),
                created: now,
                last_used: now,
            },
        );
        Ok(pair)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("key cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel the janitor and drop all cached keys
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let (_, condvar) = &self.inner.wake;
        condvar.notify_all();
        if let Some(handle) = self.janitor.lock().expect("janitor lock poisoned").take() {
            let _ = handle.join();
        }
        self.inner.entries.lock().expect("key cache lock poisoned").clear();
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
