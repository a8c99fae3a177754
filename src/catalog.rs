//! Metadata catalog
//!
//! One JSON file (`meta.ldb`) holding the map from table name to its
//! schema and statistics. The catalog is read once at startup and held in
//! memory; mutations mark it dirty and schedule a debounced save on a
//! background timer thread, so bursts of writes coalesce into one disk
//! rewrite. Saves replace the file atomically.
//!
//! A corrupt or unreadable catalog is not fatal: the engine starts with an
//! empty catalog and the table files stay on disk. `rediscover_tables`
//! offers a best-effort re-registration scan for that case.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io_util;
use crate::types::{now_millis, SchemaPatch, StorageMode, TableSchema};

/// Catalog format version written to `meta.ldb`
const CATALOG_VERSION: &str = "1.0";

/// File name of the catalog under the store root
pub const CATALOG_FILE: &str = "meta.ldb";

/// Persisted catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    version: String,
    generated_at: u64,
    tables: BTreeMap<String, TableSchema>,
}

/// Debounce signal shared with the timer thread
struct SaveSignal {
    /// When the pending save should fire, if any
    deadline: Option<Instant>,
    shutdown: bool,
}

/// The metadata catalog. Cloning shares the underlying state.
pub struct Catalog {
    path: PathBuf,
    root: PathBuf,
    tables: Arc<RwLock<BTreeMap<String, TableSchema>>>,
    dirty: Arc<AtomicBool>,
    /// Serializes concurrent saves
    save_guard: Arc<Mutex<()>>,
    save_delay: Duration,
    signal: Arc<(Mutex<SaveSignal>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Catalog {
    /// Open (or create) the catalog under `root`. The file is read
    /// synchronously; a corrupt file logs a warning and yields an empty
    /// catalog.
    pub fn open(root: &Path, save_delay: Duration) -> Result<Self> {
        let path = root.join(CATALOG_FILE);
        let tables = match io_util::read_if_exists(&path)? {
            Some(bytes) => match serde_json::from_slice::<CatalogFile>(&bytes) {
                Ok(file) => file.tables,
                Err(e) => {
                    log::warn!(
                        "catalog '{}' is unreadable ({}); starting with an empty catalog",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            None => BTreeMap::new(),
        };

        let catalog = Self {
            path,
            root: root.to_path_buf(),
            tables: Arc::new(RwLock::new(tables)),
            dirty: Arc::new(AtomicBool::new(false)),
            save_guard: Arc::new(Mutex::new(())),
            save_delay,
            signal: Arc::new((
                Mutex::new(SaveSignal {
                    deadline: None,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            worker: Mutex::new(None),
        };
        catalog.spawn_save_worker();
        Ok(catalog)
    }

    fn spawn_save_worker(&self) {
        let signal = Arc::clone(&self.signal);
        let tables = Arc::clone(&self.tables);
        let dirty = Arc::clone(&self.dirty);
        let save_guard = Arc::clone(&self.save_guard);
        let path = self.path.clone();

        let handle = thread::spawn(move || {
            let (lock, condvar) = &*signal;
            loop {
                let fire = {
                    let mut state = lock.lock().expect("catalog signal lock poisoned");
                    loop {
                        if state.shutdown {
                            return;
                        }
                        match state.deadline {
                            Some(deadline) => {
                                let now = Instant::now();
                                if now >= deadline {
                                    state.deadline = None;
                                    break true;
                                }
                                let (next, _) = condvar
                                    .wait_timeout(state, deadline - now)
                                    .expect("catalog signal lock poisoned");
                                state = next;
                            }
                            None => {
                                state = condvar.wait(state).expect("catalog signal lock poisoned");
                            }
                        }
                    }
                };

                if fire && dirty.swap(false, Ordering::SeqCst) {
                    if let Err(e) = Self::persist(&path, &tables, &save_guard) {
                        log::error!("debounced catalog save failed: {}", e);
                        dirty.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
        *self.worker.lock().expect("catalog worker lock poisoned") = Some(handle);
    }

    fn persist(
        path: &Path,
        tables: &RwLock<BTreeMap<String, TableSchema>>,
        save_guard: &Mutex<()>,
    ) -> Result<()> {
        let _guard = save_guard.lock().expect("catalog save guard poisoned");
        let snapshot = tables.read().expect("catalog lock poisoned").clone();
        let file = CatalogFile {
            version: CATALOG_VERSION.to_string(),
            generated_at: now_millis(),
            tables: snapshot,
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        io_util::atomic_write(path, &bytes)
    }

    /// Mark dirty and (re)arm the debounce timer
    fn schedule_save(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let (lock, condvar) = &*self.signal;
        let mut state = lock.lock().expect("catalog signal lock poisoned");
        state.deadline = Some(Instant::now() + self.save_delay);
        condvar.notify_one();
    }

    /// Look up a table's schema
    pub fn get(&self, table: &str) -> Option<TableSchema> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .get(table)
            .cloned()
    }

    /// Whether the catalog knows the table
    pub fn contains(&self, table: &str) -> bool {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .contains_key(table)
    }

    /// Insert a full schema (table creation)
    pub fn insert(&self, table: &str, schema: TableSchema) {
        self.tables
            .write()
            .expect("catalog lock poisoned")
            .insert(table.to_string(), schema);
        self.schedule_save();
    }

    /// Merge a partial update into a table's schema, touching `updated_at`.
    /// Unknown tables are ignored (in-flight deletes race here).
    pub fn update(&self, table: &str, patch: SchemaPatch) {
        {
            let mut tables = self.tables.write().expect("catalog lock poisoned");
            match tables.get_mut(table) {
                Some(schema) => patch.apply_to(schema),
                None => return,
            }
        }
        self.schedule_save();
    }

    /// Remove a table from the catalog
    pub fn delete(&self, table: &str) {
        let removed = self
            .tables
            .write()
            .expect("catalog lock poisoned")
            .remove(table)
            .is_some();
        if removed {
            self.schedule_save();
        }
    }

    /// All registered table names
    pub fn all_tables(&self) -> Vec<String> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// The advisory record count for a table
    pub fn count(&self, table: &str) -> Option<usize> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .get(table)
            .map(|s| s.count)
    }

    /// Block until the initial load has completed. Loading happens in
    /// `open`, so this returns immediately; kept so callers written against
    /// an async-loading catalog keep working.
    pub fn wait_for_load(&self) -> Result<()> {
        Ok(())
    }

    /// Save right now, bypassing the debounce
    pub fn save_immediately(&self) -> Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        {
            let (lock, _) = &*self.signal;
            lock.lock().expect("catalog signal lock poisoned").deadline = None;
        }
        Self::persist(&self.path, &self.tables, &self.save_guard)
    }

    /// Cancel any pending debounced save and stop the timer thread. Does
    /// not save; call `save_immediately` first when the contents matter.
    pub fn cleanup(&self) {
        {
            let (lock, condvar) = &*self.signal;
            let mut state = lock.lock().expect("catalog signal lock poisoned");
            state.deadline = None;
            state.shutdown = true;
            condvar.notify_one();
        }
        if let Some(handle) = self
            .worker
            .lock()
            .expect("catalog worker lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }

    /// Best-effort scan of the store root for table files the catalog does
    /// not know about (after a catalog rebuild). Registers `<name>.ldb` as
    /// single-mode and directories of `NNN.ldb` chunks as chunked-mode.
    /// Returns the names it registered.
    pub fn rediscover_tables(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            if file_type.is_file() {
                if name == CATALOG_FILE || !name.ends_with(".ldb") {
                    continue;
                }
                let table = name.trim_end_matches(".ldb").to_string();
                if self.contains(&table) {
                    continue;
                }
                let count = count_records_in_array_file(&entry.path());
                let mut schema = TableSchema::new(name.clone(), StorageMode::Single);
                schema.count = count;
                log::info!("rediscovered single-mode table '{}' ({} records)", table, count);
                self.insert(&table, schema);
                found.push(table);
            } else if file_type.is_dir() {
                let table = name;
                if self.contains(&table) {
                    continue;
                }
                let mut chunk_count = 0u32;
                let mut record_count = 0usize;
                for chunk in std::fs::read_dir(entry.path())? {
                    let chunk = chunk?;
                    let chunk_name = chunk.file_name().to_string_lossy().into_owned();
                    if chunk_name.ends_with(".ldb") {
                        chunk_count += 1;
                        record_count += count_records_in_array_file(&chunk.path());
                    }
                }
                if chunk_count == 0 {
                    continue;
                }
                let mut schema = TableSchema::new(format!("{}/", table), StorageMode::Chunked);
                schema.count = record_count;
                schema.chunks = Some(chunk_count);
                log::info!(
                    "rediscovered chunked table '{}' ({} chunks, {} records)",
                    table,
                    chunk_count,
                    record_count
                );
                self.insert(&table, schema);
                found.push(table);
            }
        }
        Ok(found)
    }
}

/// Parse a JSON array file and return its length; unreadable files count 0
fn count_records_in_array_file(path: &Path) -> usize {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<Vec<serde_json::Value>>(&bytes)
            .map(|v| v.len())
            .unwrap_or(0),
        Err(_) => 0,
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn short_delay() -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn test_insert_get_delete() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path(), short_delay()).unwrap();

        catalog.insert("users", TableSchema::new("users.ldb".into(), StorageMode::Single));
        assert!(catalog.contains("users"));
        assert_eq!(catalog.get("users").unwrap().path, "users.ldb");
        assert_eq!(catalog.all_tables(), vec!["users".to_string()]);

        catalog.delete("users");
        assert!(!catalog.contains("users"));
    }

    #[test]
    fn test_update_merges_and_counts() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path(), short_delay()).unwrap();

        catalog.insert("t", TableSchema::new("t.ldb".into(), StorageMode::Single));
        catalog.update("t", SchemaPatch::count(5));
        assert_eq!(catalog.count("t"), Some(5));

        // Updating an unknown table is a no-op, not a panic.
        catalog.update("missing", SchemaPatch::count(1));
        assert_eq!(catalog.count("missing"), None);
    }

    #[test]
    fn test_save_immediately_and_reload() {
        let dir = tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path(), Duration::from_secs(60)).unwrap();
            catalog.insert("t", TableSchema::new("t.ldb".into(), StorageMode::Single));
            catalog.save_immediately().unwrap();
        }

        let reopened = Catalog::open(dir.path(), short_delay()).unwrap();
        assert!(reopened.contains("t"));

        let raw = std::fs::read_to_string(dir.path().join(CATALOG_FILE)).unwrap();
        assert!(raw.contains("\"version\""));
        assert!(raw.contains("\"generatedAt\""));
        assert!(raw.contains("\"tables\""));
    }

    #[test]
    fn test_debounced_save_fires() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path(), short_delay()).unwrap();
        catalog.insert("t", TableSchema::new("t.ldb".into(), StorageMode::Single));

        // Give the debounce worker time to fire.
        std::thread::sleep(Duration::from_millis(200));
        assert!(dir.path().join(CATALOG_FILE).exists());
    }

    #[test]
    fn test_corrupt_catalog_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CATALOG_FILE), b"{not json").unwrap();

        let catalog = Catalog::open(dir.path(), short_delay()).unwrap();
        assert!(catalog.all_tables().is_empty());
    }

    #[test]
    fn test_rediscover_tables() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("users.ldb"), b"[{\"id\":1},{\"id\":2}]").unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/000.ldb"), b"[{\"id\":1}]").unwrap();
        std::fs::write(dir.path().join("logs/001.ldb"), b"[{\"id\":2}]").unwrap();

        let catalog = Catalog::open(dir.path(), short_delay()).unwrap();
        let mut found = catalog.rediscover_tables().unwrap();
        found.sort();
        assert_eq!(found, vec!["logs".to_string(), "users".to_string()]);

        assert_eq!(catalog.get("users").unwrap().count, 2);
        let logs = catalog.get("logs").unwrap();
        assert_eq!(logs.mode, StorageMode::Chunked);
        assert_eq!(logs.chunks, Some(2));
        assert_eq!(logs.count, 2);
    }
}
