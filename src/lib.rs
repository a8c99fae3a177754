//! litestore — an embedded, file-backed JSON document store
//!
//! Tables live under one root directory, either as a single JSON array
//! file (`users.ldb`) or as a directory of numbered chunk files
//! (`users/000.ldb`, `users/001.ldb`, ...). A metadata catalog
//! (`meta.ldb`) tracks every table's schema and statistics. Reads go
//! through a bounded cache and an in-memory index layer; writes keep the
//! catalog, cache and indexes in step. A background auto-sync service
//! flushes write-back entries, a single-writer transaction service gives
//! snapshot rollback, and an optional encrypted adapter provides
//! authenticated at-rest encryption.
//!
//! ```no_run
//! use litestore::{Database, Filter, StoreConfig};
//! use serde_json::json;
//!
//! # fn main() -> litestore::Result<()> {
//! let db = Database::open(StoreConfig::at("./data"))?;
//!
//! let users = vec![
//!     json!({"id": 1, "name": "Ada"}).as_object().unwrap().clone(),
//!     json!({"id": 2, "name": "Grace"}).as_object().unwrap().clone(),
//! ];
//! db.insert("users", users)?;
//!
//! let ada = db.find_one("users", Filter::eq("name", json!("Ada")))?;
//! assert!(ada.is_some());
//! # db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalog;
pub mod crypto;
pub mod encrypted;
pub mod engine;
pub mod error;
pub mod files;
pub mod index;
pub mod io_util;
pub mod query;
pub mod sync;
pub mod types;

pub use cache::{CacheConfig, CacheManager, CacheStats, EvictionStrategy};
pub use crypto::{
    CryptoConfig, CryptoService, HmacAlgorithm, MasterKeyProvider, SecureStorage,
    StaticKeyProvider,
};
pub use encrypted::{EncryptedEngine, EncryptionMode};
pub use engine::{
    BulkOp, BulkSummary, CountVerification, CreateTableOptions, Engine, Store,
};
pub use error::{ErrorCode, Result, StoreError};
pub use query::{Filter, ReadOptions, SortAlgorithm, SortField, SortOrder};
pub use sync::{AutoSyncService, SyncConfig, SyncEvent, SyncStats, SyncTarget};
pub use types::{ColumnSpec, IndexKind, Record, RecordId, SchemaPatch, StorageMode, TableSchema, WriteMode};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Store-wide configuration
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory holding the catalog and every table
    pub root_dir: PathBuf,
    /// Chunk rollover threshold in bytes of serialized JSON
    pub chunk_threshold: usize,
    /// Timeout applied to each file operation
    pub io_timeout: Duration,
    /// TTL for cached read results (jitter is added on top)
    pub result_ttl: Duration,
    /// Debounce window for catalog saves
    pub catalog_save_delay: Duration,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data"),
            chunk_threshold: files::DEFAULT_CHUNK_THRESHOLD,
            io_timeout: io_util::DEFAULT_IO_TIMEOUT,
            result_ttl: Duration::from_secs(60),
            catalog_save_delay: Duration::from_secs(1),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at the given directory
    pub fn at(root: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// A profile with short debounces and no jitter, for test suites
    pub fn for_tests(root: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root.as_ref().to_path_buf(),
            catalog_save_delay: Duration::from_millis(10),
            result_ttl: Duration::from_secs(60),
            cache: CacheConfig {
                avalanche_protection: false,
                ..Default::default()
            },
            sync: SyncConfig {
                interval: Duration::from_millis(50),
                base_backoff: Duration::from_millis(1),
                max_jitter: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// The engine a [`Database`] fronts: the plaintext engine directly, or
/// the encrypted adapter decorating it.
enum Backend {
    Plain(Arc<Engine>),
    Encrypted(Arc<EncryptedEngine>),
}

/// Owns an [`Engine`] (or an [`EncryptedEngine`] decorating one) plus the
/// auto-sync worker, and wires them together. There is no implicit global
/// instance; callers construct and own their `Database`.
pub struct Database {
    backend: Backend,
    auto_sync: Arc<AutoSyncService>,
}

impl Database {
    /// Open (or create) a plaintext store and start its background
    /// services
    pub fn open(config: StoreConfig) -> Result<Self> {
        let engine = Arc::new(Engine::open(&config)?);
        let auto_sync = Self::wire_auto_sync(&engine, &config);
        Ok(Self {
            backend: Backend::Plain(engine),
            auto_sync,
        })
    }

    /// Open (or create) a store whose payloads go through the encrypted
    /// adapter. The auto-sync worker and flush hook are wired to the
    /// shared plaintext engine underneath, exactly as in [`open`].
    ///
    /// [`open`]: Database::open
    pub fn open_encrypted(
        config: StoreConfig,
        crypto_config: CryptoConfig,
        key_provider: Arc<dyn MasterKeyProvider>,
        require_auth_on_access: bool,
    ) -> Result<Self> {
        let engine = Arc::new(Engine::open(&config)?);
        let auto_sync = Self::wire_auto_sync(&engine, &config);
        let encrypted = Arc::new(EncryptedEngine::new(
            engine,
            crypto_config,
            key_provider,
            require_auth_on_access,
        ));
        Ok(Self {
            backend: Backend::Encrypted(encrypted),
            auto_sync,
        })
    }

    fn wire_auto_sync(engine: &Arc<Engine>, config: &StoreConfig) -> Arc<AutoSyncService> {
        let cache = engine.cache();
        let auto_sync = Arc::new(AutoSyncService::new(
            Arc::clone(&cache),
            Arc::clone(engine) as Arc<dyn SyncTarget>,
            config.sync.clone(),
        ));

        // When eviction finds nothing but dirty entries, the cache drains
        // through the sync service and retries.
        let hook_sync = Arc::clone(&auto_sync);
        cache.set_flush_hook(Box::new(move || {
            hook_sync.flush_now();
            Ok(())
        }));

        auto_sync.start();
        auto_sync
    }

    /// The active store surface (plaintext or encrypted)
    pub fn store(&self) -> &dyn Store {
        match &self.backend {
            Backend::Plain(engine) => engine.as_ref(),
            Backend::Encrypted(encrypted) => encrypted.as_ref(),
        }
    }

    /// The underlying plaintext engine. For an encrypted store this is
    /// the decorated inner engine: reads through it see ciphertext.
    pub fn engine(&self) -> &Arc<Engine> {
        match &self.backend {
            Backend::Plain(engine) => engine,
            Backend::Encrypted(encrypted) => encrypted.inner(),
        }
    }

    /// The encrypted adapter, when this store was opened with
    /// [`open_encrypted`]
    ///
    /// [`open_encrypted`]: Database::open_encrypted
    pub fn encrypted_engine(&self) -> Option<&Arc<EncryptedEngine>> {
        match &self.backend {
            Backend::Plain(_) => None,
            Backend::Encrypted(encrypted) => Some(encrypted),
        }
    }

    pub fn auto_sync(&self) -> &AutoSyncService {
        &self.auto_sync
    }

    /// Stop background services, drain dirty entries, persist the catalog
    pub fn close(&self) -> Result<()> {
        self.auto_sync.stop();
        match &self.backend {
            Backend::Plain(engine) => engine.close(),
            Backend::Encrypted(encrypted) => encrypted.close(),
        }
    }

    // The Store surface, routed through the active backend.

    pub fn create_table(&self, table: &str, options: CreateTableOptions) -> Result<()> {
        self.store().create_table(table, options)
    }

    pub fn delete_table(&self, table: &str) -> Result<()> {
        self.store().delete_table(table)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.store().has_table(table)
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.store().list_tables()
    }

    pub fn insert(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        self.store().insert(table, records)
    }

    pub fn overwrite(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        self.store().overwrite(table, records)
    }

    pub fn read(&self, table: &str, options: ReadOptions) -> Result<Vec<Record>> {
        self.store().read(table, options)
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        self.store().count(table)
    }

    pub fn verify_count(&self, table: &str) -> Result<CountVerification> {
        self.store().verify_count(table)
    }

    pub fn find_one(&self, table: &str, filter: Filter) -> Result<Option<Record>> {
        self.store().find_one(table, filter)
    }

    pub fn find_many(
        &self,
        table: &str,
        filter: Option<Filter>,
        options: ReadOptions,
    ) -> Result<Vec<Record>> {
        self.store().find_many(table, filter, options)
    }

    pub fn update(&self, table: &str, data: serde_json::Value, filter: Filter) -> Result<usize> {
        self.store().update(table, data, filter)
    }

    pub fn delete(&self, table: &str, filter: Filter) -> Result<usize> {
        self.store().delete(table, filter)
    }

    pub fn clear_table(&self, table: &str) -> Result<()> {
        self.store().clear_table(table)
    }

    pub fn bulk_write(&self, table: &str, ops: Vec<BulkOp>) -> Result<BulkSummary> {
        self.store().bulk_write(table, ops)
    }

    pub fn begin_transaction(&self) -> Result<()> {
        self.store().begin_transaction()
    }

    pub fn commit(&self) -> Result<()> {
        self.store().commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.store().rollback()
    }

    // Engine-level operations on the underlying storage, valid for both
    // backends (they act on the stored representation).

    pub fn migrate_to_chunked(&self, table: &str) -> Result<()> {
        self.engine().migrate_to_chunked(table)
    }

    pub fn create_index(&self, table: &str, field: &str, kind: IndexKind) -> Result<()> {
        self.engine().create_index(table, field, kind)
    }

    pub fn drop_index(&self, table: &str, field: &str) -> Result<()> {
        self.engine().drop_index(table, field)
    }

    /// Plaintext write-back through the dirty cache; see
    /// [`Engine::write_deferred`]
    pub fn write_deferred(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        self.engine().write_deferred(table, records)
    }

    pub fn find_by_id(&self, table: &str, id: &RecordId) -> Result<Option<Record>> {
        match &self.backend {
            Backend::Plain(engine) => engine.find_by_id(table, id),
            // The per-id cache holds ciphertext for an encrypted store;
            // go through the decrypting read path instead.
            Backend::Encrypted(encrypted) => {
                encrypted.find_one(table, Filter::eq("id", id.to_value()))
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("error while closing store: {}", e);
        }
    }
}
