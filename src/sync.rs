//! Auto-sync service
//!
//! Background loop that drains dirty cache entries back to their tables.
//! Each pass snapshots the dirty set, groups it by table (the cache-key
//! contract: `<table>_<suffix>`, table name is everything before the LAST
//! underscore, suffixes never contain one), splits each group into
//! batches, and flushes every batch through the engine's direct-write
//! path. Entries are only marked clean with the exact value that was
//! flushed, so a write landing mid-flush keeps its dirty bit.
//!
//! Transient failures (timeout / network / connection / busy / locked /
//! unavailable) retry with exponential backoff plus jitter; anything else
//! fails the batch immediately. At most one flush runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::cache::CacheManager;
use crate::engine::Engine;
use crate::error::Result;

/// The narrow interface the flusher needs from the engine. Keeps the
/// dependency arrow pointing at the sync service, not out of the cache.
pub trait SyncTarget: Send + Sync {
    /// Merge a batch of `(cache key, record value)` pairs into a table
    fn flush_table(&self, table: &str, entries: &[(String, Value)]) -> Result<()>;
}

impl SyncTarget for Engine {
    fn flush_table(&self, table: &str, entries: &[(String, Value)]) -> Result<()> {
        self.apply_dirty_batch(table, entries)
    }
}

/// Auto-sync tuning knobs
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pause between flush passes
    pub interval: Duration,
    /// Skip a pass when fewer dirty entries than this are waiting
    pub min_items: usize,
    /// Entries flushed per direct write
    pub batch_size: usize,
    /// Retry attempts for transient failures
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub base_backoff: Duration,
    /// Up to this much random jitter is added to each backoff
    pub max_jitter: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_items: 1,
            batch_size: 100,
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        }
    }
}

/// Lifecycle events emitted to subscribers
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass started with this many dirty entries
    SyncStart { dirty: usize },
    /// A pass finished; counts cover the whole pass
    SyncComplete {
        flushed: usize,
        tables: usize,
        failed_batches: usize,
        duration: Duration,
    },
    /// One batch gave up (non-transient error or retries exhausted)
    SyncFailed { table: String, error: String },
    /// The pass itself could not run
    SyncError { error: String },
}

/// Aggregate counters across the service lifetime
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub passes: u64,
    pub entries_flushed: u64,
    pub batches_failed: u64,
    pub retries: u64,
    pub last_pass_duration: Duration,
}

struct Shared {
    cache: Arc<CacheManager>,
    target: Arc<dyn SyncTarget>,
    config: SyncConfig,
    /// Serializes flush passes: worker ticks and manual flushes alike
    flush_lock: Mutex<()>,
    subscribers: Mutex<Vec<mpsc::Sender<SyncEvent>>>,
    stats: Mutex<SyncStats>,
    shutdown: AtomicBool,
    wake: (Mutex<()>, Condvar),
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// One full flush pass. Returns the number of entries flushed.
    fn flush_pass(&self) -> usize {
        let _guard = self.flush_lock.lock().expect("flush lock poisoned");

        let dirty = self.cache.dirty_data();
        if dirty.len() < self.config.min_items.max(1) {
            return 0;
        }
        self.emit(SyncEvent::SyncStart { dirty: dirty.len() });
        let started = Instant::now();

        // Group by table per the key contract.
        let mut groups: Vec<(String, Vec<(String, Value)>)> = Vec::new();
        for (key, value) in dirty {
            let table = match key.rfind('_') {
                Some(pos) if pos > 0 => key[..pos].to_string(),
                _ => {
                    log::warn!("dirty key '{}' does not follow <table>_<id>; skipping", key);
                    continue;
                }
            };
            match groups.iter_mut().find(|(t, _)| *t == table) {
                Some((_, entries)) => entries.push((key, value)),
                None => groups.push((table, vec![(key, value)])),
            }
        }

        let mut flushed = 0usize;
        let mut failed_batches = 0usize;
        let table_count = groups.len();

        for (table, entries) in groups {
            for batch in entries.chunks(self.config.batch_size) {
                match self.flush_batch(&table, batch) {
                    Ok(()) => {
                        self.cache.mark_clean_bulk(batch);
                        flushed += batch.len();
                    }
                    Err(e) => {
                        failed_batches += 1;
                        log::error!("auto-sync batch for '{}' failed: {}", table, e);
                        self.emit(SyncEvent::SyncFailed {
                            table: table.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        let duration = started.elapsed();
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.passes += 1;
            stats.entries_flushed += flushed as u64;
            stats.batches_failed += failed_batches as u64;
            stats.last_pass_duration = duration;
        }
        self.emit(SyncEvent::SyncComplete {
            flushed,
            tables: table_count,
            failed_batches,
            duration,
        });
        flushed
    }

    /// Flush one batch, retrying transient failures with backoff + jitter
    fn flush_batch(&self, table: &str, batch: &[(String, Value)]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.target.flush_table(table, batch) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let backoff = self.config.base_backoff * 2u32.saturating_pow(attempt);
                    let jitter_ms = if self.config.max_jitter.is_zero() {
                        0
                    } else {
                        rand::thread_rng().gen_range(0..=self.config.max_jitter.as_millis() as u64)
                    };
                    let delay = backoff + Duration::from_millis(jitter_ms);
                    log::warn!(
                        "transient auto-sync failure on '{}' (attempt {}): {}; retrying in {:?}",
                        table,
                        attempt + 1,
                        e,
                        delay
                    );
                    self.stats.lock().expect("stats lock poisoned").retries += 1;
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The auto-sync service. Owns a worker thread between `start` and `stop`.
pub struct AutoSyncService {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSyncService {
    pub fn new(cache: Arc<CacheManager>, target: Arc<dyn SyncTarget>, config: SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                target,
                config,
                flush_lock: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                stats: Mutex::new(SyncStats::default()),
                shutdown: AtomicBool::new(false),
                wake: (Mutex::new(()), Condvar::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the periodic flush loop. Starting twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if worker.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(thread::spawn(move || {
            log::info!(
                "auto-sync started (interval {:?}, batch size {})",
                shared.config.interval,
                shared.config.batch_size
            );
            loop {
                {
                    let (lock, condvar) = &shared.wake;
                    let guard = lock.lock().expect("wake lock poisoned");
                    let _ = condvar
                        .wait_timeout(guard, shared.config.interval)
                        .expect("wake lock poisoned");
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    // Final drain so no dirty entry dies with the process.
                    shared.flush_pass();
                    log::info!("auto-sync stopped");
                    return;
                }
                shared.flush_pass();
            }
        }));
    }

    /// Run one flush pass on the caller's thread. Serialized with the
    /// worker's passes. Returns the number of entries flushed.
    pub fn flush_now(&self) -> usize {
        self.shared.flush_pass()
    }

    /// Receive lifecycle events. Dropped receivers unsubscribe themselves.
    pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    pub fn stats(&self) -> SyncStats {
        *self.shared.stats.lock().expect("stats lock poisoned")
    }

    /// Signal shutdown and wait for the in-flight pass to finish. The
    /// worker performs a final drain before exiting.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let (_, condvar) = &self.shared.wake;
        condvar.notify_all();
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AutoSyncService {
    fn drop(&mut self) {
        self.stop();
    }
}
