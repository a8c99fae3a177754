//! Storage engine
//!
//! `Engine` owns the catalog, the cache, the index manager and the
//! transaction service, and exposes the table lifecycle plus the
//! read/write operations. The read path lives in [`reader`], the write
//! path in [`writer`], the transaction service in [`transaction`].
//!
//! The [`Store`] trait captures the operation surface shared by the
//! plaintext engine and the encrypted adapter, so callers can hold either
//! behind one interface.

pub mod reader;
pub mod transaction;
pub mod writer;

pub use reader::CountVerification;
pub use transaction::{BulkOp, QueuedOp, TransactionService, TxnPhase};
pub use writer::BulkSummary;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cache::CacheManager;
use crate::catalog::Catalog;
use crate::error::{ErrorCode, Result, StoreError};
use crate::files::{self, ChunkedFileHandler};
use crate::index::IndexManager;
use crate::query::{Filter, ReadOptions};
use crate::types::{ColumnSpec, IndexKind, Record, SchemaPatch, StorageMode, TableSchema, WriteMode};
use crate::StoreConfig;

/// Options accepted by `create_table`
#[derive(Clone, Default)]
pub struct CreateTableOptions {
    /// Column type hints (advisory)
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Records written at creation
    pub initial_data: Vec<Record>,
    /// Storage mode; omitted means the size heuristic decides
    pub mode: Option<StorageMode>,
    /// Indexes to declare and build
    pub indexes: BTreeMap<String, IndexKind>,
    /// Bypass the cache for every read of this table
    pub is_high_risk: bool,
    pub high_risk_fields: Vec<String>,
    /// Fields the encrypted adapter protects
    pub encrypted_fields: Vec<String>,
}

/// The operation surface shared by [`Engine`] and the encrypted adapter
pub trait Store: Send + Sync {
    fn create_table(&self, table: &str, options: CreateTableOptions) -> Result<()>;
    fn delete_table(&self, table: &str) -> Result<()>;
    fn has_table(&self, table: &str) -> bool;
    fn list_tables(&self) -> Vec<String>;
    fn insert(&self, table: &str, records: Vec<Record>) -> Result<usize>;
    fn overwrite(&self, table: &str, records: Vec<Record>) -> Result<usize>;
    fn read(&self, table: &str, options: ReadOptions) -> Result<Vec<Record>>;
    fn count(&self, table: &str) -> Result<usize>;
    fn verify_count(&self, table: &str) -> Result<CountVerification>;
    fn find_one(&self, table: &str, filter: Filter) -> Result<Option<Record>>;
    fn find_many(&self, table: &str, filter: Option<Filter>, options: ReadOptions)
        -> Result<Vec<Record>>;
    fn update(&self, table: &str, data: Value, filter: Filter) -> Result<usize>;
    fn delete(&self, table: &str, filter: Filter) -> Result<usize>;
    fn clear_table(&self, table: &str) -> Result<()>;
    fn bulk_write(&self, table: &str, ops: Vec<BulkOp>) -> Result<BulkSummary>;
    fn begin_transaction(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// The plaintext storage engine
pub struct Engine {
    pub(crate) root: PathBuf,
    pub(crate) chunk_threshold: usize,
    pub(crate) io_timeout: Duration,
    /// TTL for cached read results
    pub(crate) result_ttl: Duration,
    pub(crate) catalog: Catalog,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) indexes: IndexManager,
    pub(crate) txn: TransactionService,
    /// Per-table registry of cache keys written by the read path, for
    /// precise invalidation
    pub(crate) cache_keys: Mutex<HashMap<String, HashSet<String>>>,
}

impl Engine {
    /// Open an engine rooted at `config.root_dir`, creating the directory
    /// and loading the catalog.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root_dir)?;
        let catalog = Catalog::open(&config.root_dir, config.catalog_save_delay)?;
        let cache = Arc::new(CacheManager::new(config.cache.clone()));

        log::info!(
            "litestore engine opened at {:?} ({} tables)",
            config.root_dir,
            catalog.all_tables().len()
        );

        Ok(Self {
            root: config.root_dir.clone(),
            chunk_threshold: config.chunk_threshold,
            io_timeout: config.io_timeout,
            result_ttl: config.result_ttl,
            catalog,
            cache,
            indexes: IndexManager::new(),
            txn: TransactionService::new(),
            cache_keys: Mutex::new(HashMap::new()),
        })
    }

    /// Shared handle to the cache, for wiring the auto-sync service
    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache)
    }

    /// Whether a transaction is currently active
    pub fn in_transaction(&self) -> bool {
        self.txn.is_active()
    }

    /// The metadata catalog; exposed for diagnostics and tests
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Create a table. Creating an existing table is a no-op, so creation
    /// is idempotent.
    pub fn create_table(&self, table: &str, options: CreateTableOptions) -> Result<()> {
        writer::validate_table_name(table)?;
        if self.catalog.contains(table) {
            return Ok(());
        }

        let mode = options.mode.unwrap_or_else(|| {
            if files::should_use_chunked(&options.initial_data, self.chunk_threshold) {
                StorageMode::Chunked
            } else {
                StorageMode::Single
            }
        });
        let path = match mode {
            StorageMode::Single => format!("{}.ldb", table),
            StorageMode::Chunked => format!("{}/", table),
        };

        let mut schema = TableSchema::new(path, mode);
        schema.columns = options.columns;
        schema.count = options.initial_data.len();
        schema.is_high_risk = options.is_high_risk;
        if !options.high_risk_fields.is_empty() {
            schema.high_risk_fields = Some(options.high_risk_fields);
        }
        if !options.encrypted_fields.is_empty() {
            schema.encrypted_fields = Some(options.encrypted_fields);
        }
        if !options.indexes.is_empty() {
            schema.indexes = Some(options.indexes.clone());
        }

        // Materialize the files first so "catalog entry exists" implies
        // "table files exist".
        let handler = self.file_handler(table, mode);
        let chunks = handler.write(options.initial_data.clone()).map_err(|e| {
            StoreError::new(
                ErrorCode::TableCreateFailed,
                format!("failed to create table '{}'", table),
            )
            .with_cause(e)
        })?;
        if mode == StorageMode::Chunked {
            schema.chunks = Some(chunks);
        }

        for (field, kind) in &options.indexes {
            self.indexes
                .create_index(table, field, *kind, &options.initial_data)
                .map_err(|e| {
                    // Roll the files back; creation failed as a whole.
                    let _ = handler.delete();
                    StoreError::new(
                        ErrorCode::TableCreateFailed,
                        format!("failed to build index '{}' on '{}'", field, table),
                    )
                    .with_cause(e)
                })?;
        }

        self.catalog.insert(table, schema);
        log::debug!("created table '{}' in {} mode", table, mode);
        Ok(())
    }

    /// Drop a table and its files. Deleting an unknown table is a no-op.
    pub fn delete_table(&self, table: &str) -> Result<()> {
        let schema = match self.catalog.get(table) {
            Some(schema) => schema,
            None => return Ok(()),
        };

        self.file_handler(table, schema.mode).delete().map_err(|e| {
            StoreError::new(
                ErrorCode::TableDeleteFailed,
                format!("failed to delete table '{}'", table),
            )
            .with_cause(e)
        })?;

        self.catalog.delete(table);
        self.indexes.drop_table(table);
        self.invalidate_table_cache(table);
        // Dropping the table also drops its pending write-back entries.
        let prefix = format!("{}_", table);
        for (key, _) in self.cache.dirty_data() {
            if key.starts_with(&prefix) && key.rfind('_').map(|p| &key[..p] == table).unwrap_or(false) {
                self.cache.delete(&key);
            }
        }
        Ok(())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.catalog.contains(table)
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.catalog.all_tables()
    }

    /// Declare and build an index over the table's current data
    pub fn create_index(&self, table: &str, field: &str, kind: IndexKind) -> Result<()> {
        let schema = self
            .catalog
            .get(table)
            .ok_or_else(|| StoreError::table_not_found(table))?;
        let records = self.read_from_disk(table)?;
        self.indexes.create_index(table, field, kind, &records)?;

        let mut indexes = schema.indexes.unwrap_or_default();
        indexes.insert(field.to_string(), kind);
        self.catalog.update(
            table,
            SchemaPatch {
                indexes: Some(indexes),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Drop an index declaration and its in-memory data
    pub fn drop_index(&self, table: &str, field: &str) -> Result<()> {
        let schema = self
            .catalog
            .get(table)
            .ok_or_else(|| StoreError::table_not_found(table))?;
        self.indexes.drop_index(table, field);

        if let Some(mut indexes) = schema.indexes {
            indexes.remove(field);
            self.catalog.update(
                table,
                SchemaPatch {
                    indexes: Some(indexes),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    /// Convert a single-mode table to chunked mode: write a temp chunked
    /// copy, verify it, swap it into place, verify again. On failure the
    /// original is restored from the records still in memory. Strict:
    /// unknown table is an error; an already-chunked table is a no-op.
    pub fn migrate_to_chunked(&self, table: &str) -> Result<()> {
        let schema = self
            .catalog
            .get(table)
            .ok_or_else(|| StoreError::table_not_found(table))?;
        if schema.mode == StorageMode::Chunked {
            return Ok(());
        }

        let records = self.read_from_disk(table)?;
        let expected = records.len();

        let temp_name = format!("{}.migrate", table);
        let temp = ChunkedFileHandler::new(
            self.root.join(&temp_name),
            self.chunk_threshold,
            self.io_timeout,
        );

        let migrate = || -> Result<u32> {
            temp.write(records.clone())?;
            let copied = temp.read_all()?.unwrap_or_default();
            if copied.len() != expected {
                return Err(StoreError::new(
                    ErrorCode::MigrationFailed,
                    format!(
                        "chunked copy of '{}' holds {} records, expected {}",
                        table,
                        copied.len(),
                        expected
                    ),
                ));
            }

            self.file_handler(table, StorageMode::Single).delete()?;
            std::fs::rename(self.root.join(&temp_name), self.root.join(table))?;

            let swapped = ChunkedFileHandler::new(
                self.root.join(table),
                self.chunk_threshold,
                self.io_timeout,
            );
            let landed = swapped.read_all()?.unwrap_or_default();
            if landed.len() != expected {
                return Err(StoreError::new(
                    ErrorCode::MigrationFailed,
                    format!(
                        "migrated table '{}' holds {} records, expected {}",
                        table,
                        landed.len(),
                        expected
                    ),
                ));
            }
            swapped.chunk_count()
        };

        match migrate() {
            Ok(chunks) => {
                self.catalog.update(
                    table,
                    SchemaPatch {
                        mode: Some(StorageMode::Chunked),
                        path: Some(format!("{}/", table)),
                        chunks: Some(chunks),
                        count: Some(expected),
                        ..Default::default()
                    },
                );
                let _ = temp.delete();
                self.indexes.drop_table(table);
                self.invalidate_table_cache(table);
                log::info!("migrated '{}' to chunked mode ({} chunks)", table, chunks);
                Ok(())
            }
            Err(e) => {
                // Restore the single file from the in-memory records and
                // remove whatever the failed attempt left behind.
                let _ = temp.delete();
                let _ = ChunkedFileHandler::new(
                    self.root.join(table),
                    self.chunk_threshold,
                    self.io_timeout,
                )
                .delete();
                if let Err(restore_err) = self
                    .file_handler(table, StorageMode::Single)
                    .write(records)
                {
                    log::error!(
                        "failed to restore '{}' after migration failure: {}",
                        table,
                        restore_err
                    );
                }
                Err(StoreError::new(
                    ErrorCode::MigrationFailed,
                    format!("migration of '{}' to chunked mode failed", table),
                )
                .with_cause(e))
            }
        }
    }

    /// Enter a transaction. Only one can be active per engine.
    pub fn begin_transaction(&self) -> Result<()> {
        self.txn.begin()
    }

    /// Replay the queued operations against disk. Any failure rolls the
    /// whole transaction back and surfaces the original error.
    pub fn commit(&self) -> Result<()> {
        let ops = self.txn.take_for_commit()?;

        for (table, op) in ops {
            let result = match op {
                QueuedOp::Write { records, mode } => {
                    self.direct_write(&table, records, mode).map(|_| ())
                }
                QueuedOp::Update { data, filter } => {
                    Engine::update(self, &table, data, filter).map(|_| ())
                }
                QueuedOp::Delete { filter } => Engine::delete(self, &table, filter).map(|_| ()),
                QueuedOp::Bulk { ops } => Engine::bulk_write(self, &table, ops).map(|_| ()),
            };

            if let Err(e) = result {
                log::error!("commit failed on '{}', rolling back: {}", table, e);
                if let Ok(snapshots) = self.txn.take_for_rollback() {
                    self.restore_snapshots(snapshots);
                }
                self.txn.finish();
                return Err(e);
            }
        }

        self.txn.finish();
        Ok(())
    }

    /// Discard the queued operations and restore every touched table
    pub fn rollback(&self) -> Result<()> {
        let snapshots = self.txn.take_for_rollback()?;
        self.restore_snapshots(snapshots);
        self.txn.finish();
        Ok(())
    }

    /// Write each snapshot back through the direct path. A `None`
    /// snapshot means the table did not exist before the transaction, so
    /// the restore removes whatever the transaction conjured up instead
    /// of materializing an empty table. Restore errors are logged, never
    /// propagated: they must not mask the error that triggered the
    /// rollback.
    fn restore_snapshots(&self, snapshots: HashMap<String, Option<Vec<Record>>>) {
        for (table, snapshot) in snapshots {
            let result = match snapshot {
                Some(records) => self
                    .direct_write(&table, records, WriteMode::Overwrite)
                    .map(|_| ()),
                None => self.delete_table(&table),
            };
            if let Err(e) = result {
                log::error!("rollback restore of '{}' failed: {}", table, e);
            }
        }
    }

    /// Flush a batch of write-back entries into a table: upsert each
    /// pending record by id over the disk state, then overwrite. The
    /// auto-sync service drives this.
    pub(crate) fn apply_dirty_batch(&self, table: &str, entries: &[(String, Value)]) -> Result<()> {
        let mut records = self.read_from_disk(table)?;
        for (_, value) in entries {
            let record = match value {
                Value::Object(record) => record.clone(),
                _ => continue,
            };
            match crate::types::RecordId::of_record(&record) {
                Some(id) => {
                    match records
                        .iter_mut()
                        .find(|r| crate::types::RecordId::of_record(r).as_ref() == Some(&id))
                    {
                        Some(existing) => *existing = record,
                        None => records.push(record),
                    }
                }
                None => records.push(record),
            }
        }
        self.direct_write(table, records, WriteMode::Overwrite)?;
        Ok(())
    }

    /// Flush state and stop background work. The engine stays usable for
    /// reads afterwards, but callers are expected to drop it.
    pub fn close(&self) -> Result<()> {
        self.catalog.save_immediately()?;
        self.catalog.cleanup();
        Ok(())
    }
}

impl Store for Engine {
    fn create_table(&self, table: &str, options: CreateTableOptions) -> Result<()> {
        Engine::create_table(self, table, options)
    }
    fn delete_table(&self, table: &str) -> Result<()> {
        Engine::delete_table(self, table)
    }
    fn has_table(&self, table: &str) -> bool {
        Engine::has_table(self, table)
    }
    fn list_tables(&self) -> Vec<String> {
        Engine::list_tables(self)
    }
    fn insert(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        Engine::insert(self, table, records)
    }
    fn overwrite(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        Engine::overwrite(self, table, records)
    }
    fn read(&self, table: &str, options: ReadOptions) -> Result<Vec<Record>> {
        Engine::read(self, table, options)
    }
    fn count(&self, table: &str) -> Result<usize> {
        Engine::count(self, table)
    }
    fn verify_count(&self, table: &str) -> Result<CountVerification> {
        Engine::verify_count(self, table)
    }
    fn find_one(&self, table: &str, filter: Filter) -> Result<Option<Record>> {
        Engine::find_one(self, table, filter)
    }
    fn find_many(
        &self,
        table: &str,
        filter: Option<Filter>,
        options: ReadOptions,
    ) -> Result<Vec<Record>> {
        Engine::find_many(self, table, filter, options)
    }
    fn update(&self, table: &str, data: Value, filter: Filter) -> Result<usize> {
        Engine::update(self, table, data, filter)
    }
    fn delete(&self, table: &str, filter: Filter) -> Result<usize> {
        Engine::delete(self, table, filter)
    }
    fn clear_table(&self, table: &str) -> Result<()> {
        Engine::clear_table(self, table)
    }
    fn bulk_write(&self, table: &str, ops: Vec<BulkOp>) -> Result<BulkSummary> {
        Engine::bulk_write(self, table, ops)
    }
    fn begin_transaction(&self) -> Result<()> {
        Engine::begin_transaction(self)
    }
    fn commit(&self) -> Result<()> {
        Engine::commit(self)
    }
    fn rollback(&self) -> Result<()> {
        Engine::rollback(self)
    }
}
