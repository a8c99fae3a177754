//! Encrypted adapter
//!
//! `EncryptedEngine` decorates the plaintext [`Engine`]: payloads are
//! encrypted before they reach the inner write path and decrypted after
//! the inner read path. Both engines implement [`Store`], so callers hold
//! either behind the same interface.
//!
//! Two per-table layouts:
//! - field level (the default): only the configured fields are encrypted,
//!   each record separately, so appends never touch existing records;
//! - whole table: the entire record array is serialized, encrypted once,
//!   and stored as the single record `{"__enc": <envelope>}`. Appends
//!   must read-decrypt-merge-re-encrypt-write, so this layout is only for
//!   tables that ask for it.
//!
//! The read path detects `__enc` (whole table) and `__enc_bulk` (one
//! envelope per record, written by the batched append path); anything else
//! gets field-level decryption. Query predicates always run after
//! decryption — there is no searchable encryption here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::crypto::{CryptoConfig, CryptoService, MasterKeyProvider};
use crate::engine::{
    BulkOp, BulkSummary, CountVerification, CreateTableOptions, Engine, Store,
};
use crate::error::{ErrorCode, Result, StoreError};
use crate::query::{apply_read_options, Filter, ReadOptions};
use crate::types::Record;

/// Whole-table marker field
const ENC_MARKER: &str = "__enc";
/// Per-record batched marker field
const ENC_BULK_MARKER: &str = "__enc_bulk";

/// How a table's payloads are laid out at rest
#[derive(Debug, Clone)]
pub enum EncryptionMode {
    /// Encrypt the listed fields of each record; an empty list means
    /// every field except `id`
    FieldLevel(Vec<String>),
    /// Encrypt the whole record array into one `__enc` record
    WholeTable,
}

pub struct EncryptedEngine {
    /// The decorated plaintext engine. Held behind `Arc` so the
    /// `Database` facade can wire the auto-sync service to the same
    /// instance.
    inner: Arc<Engine>,
    crypto: CryptoService,
    key_provider: Arc<dyn MasterKeyProvider>,
    /// Fetch the key per access instead of caching it for the session
    require_auth_on_access: bool,
    session_key: Mutex<Option<String>>,
    /// Per-table layout overrides; tables not listed here fall back to
    /// the catalog's `encryptedFields`, then to all-fields field-level
    modes: RwLock<HashMap<String, EncryptionMode>>,
    /// Decrypted-table cache, invalidated on every write
    plaintext: Mutex<HashMap<String, Vec<Record>>>,
}

impl EncryptedEngine {
    pub fn new(
        inner: Arc<Engine>,
        crypto_config: CryptoConfig,
        key_provider: Arc<dyn MasterKeyProvider>,
        require_auth_on_access: bool,
    ) -> Self {
        Self {
            inner,
            crypto: CryptoService::new(crypto_config),
            key_provider,
            require_auth_on_access,
            session_key: Mutex::new(None),
            modes: RwLock::new(HashMap::new()),
            plaintext: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped plaintext engine
    pub fn inner(&self) -> &Arc<Engine> {
        &self.inner
    }

    /// Configure a table's at-rest layout
    pub fn set_table_mode(&self, table: &str, mode: EncryptionMode) {
        self.modes
            .write()
            .expect("mode lock poisoned")
            .insert(table.to_string(), mode);
        self.invalidate_plain(table);
    }

    fn table_mode(&self, table: &str) -> EncryptionMode {
        if let Some(mode) = self.modes.read().expect("mode lock poisoned").get(table) {
            return mode.clone();
        }
        let fields = self
            .inner
            .catalog()
            .get(table)
            .and_then(|schema| schema.encrypted_fields)
            .unwrap_or_default();
        EncryptionMode::FieldLevel(fields)
    }

    fn master_key(&self) -> Result<String> {
        if self.require_auth_on_access {
            // Fetched per call, dropped with the request.
            return self.key_provider.master_key(true);
        }
        let mut session = self.session_key.lock().expect("session key lock poisoned");
        if let Some(key) = session.as_ref() {
            return Ok(key.clone());
        }
        let key = self.key_provider.master_key(false)?;
        *session = Some(key.clone());
        Ok(key)
    }

    fn invalidate_plain(&self, table: &str) {
        self.plaintext
            .lock()
            .expect("plaintext cache lock poisoned")
            .remove(table);
    }

    fn wrap_decrypt(table: &str, e: StoreError) -> StoreError {
        if e.code == ErrorCode::DecryptFailed {
            return e;
        }
        StoreError::new(
            ErrorCode::DecryptFailed,
            format!("failed to decrypt table '{}'", table),
        )
        .with_cause(e)
    }

    /// Decrypt one raw stored array into logical records
    fn decrypt_records(&self, table: &str, raw: Vec<Record>) -> Result<Vec<Record>> {
        let key = self.master_key()?;
        let fields = match self.table_mode(table) {
            EncryptionMode::FieldLevel(fields) => fields,
            EncryptionMode::WholeTable => Vec::new(),
        };

        let mut out = Vec::new();
        for record in raw {
            if let Some(Value::String(payload)) = record.get(ENC_MARKER) {
                let plaintext = self
                    .crypto
                    .decrypt(payload, &key)
                    .map_err(|e| Self::wrap_decrypt(table, e))?;
                let array: Vec<Record> = serde_json::from_str(&plaintext).map_err(|e| {
                    StoreError::new(
                        ErrorCode::DecryptFailed,
                        format!("whole-table payload of '{}' is not a record array", table),
                    )
                    .with_cause(e)
                })?;
                out.extend(array);
            } else if let Some(Value::String(payload)) = record.get(ENC_BULK_MARKER) {
                let plaintext = self
                    .crypto
                    .decrypt(payload, &key)
                    .map_err(|e| Self::wrap_decrypt(table, e))?;
                let decoded: Record = serde_json::from_str(&plaintext).map_err(|e| {
                    StoreError::new(
                        ErrorCode::DecryptFailed,
                        format!("batched payload of '{}' is not a record", table),
                    )
                    .with_cause(e)
                })?;
                out.push(decoded);
            } else {
                out.push(
                    self.crypto
                        .decrypt_fields(&record, &fields, &key)
                        .map_err(|e| Self::wrap_decrypt(table, e))?,
                );
            }
        }
        Ok(out)
    }

    /// The table's decrypted records, via the plaintext cache. Inside a
    /// transaction the cache is skipped so the view stays live.
    fn read_plain(&self, table: &str) -> Result<Vec<Record>> {
        if !self.inner.in_transaction() {
            if let Some(cached) = self
                .plaintext
                .lock()
                .expect("plaintext cache lock poisoned")
                .get(table)
            {
                return Ok(cached.clone());
            }
        }

        let raw = self.inner.read(table, ReadOptions::all())?;
        let plain = self.decrypt_records(table, raw)?;

        if !self.inner.in_transaction() {
            self.plaintext
                .lock()
                .expect("plaintext cache lock poisoned")
                .insert(table.to_string(), plain.clone());
        }
        Ok(plain)
    }

    /// Encrypt logical records into their stored form
    fn encrypt_records(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let key = self.master_key()?;
        match self.table_mode(table) {
            EncryptionMode::FieldLevel(fields) => self
                .crypto
                .encrypt_fields_bulk(&records, &fields, &key),
            EncryptionMode::WholeTable => {
                let plaintext = serde_json::to_string(&records).map_err(|e| {
                    StoreError::new(
                        ErrorCode::EncryptFailed,
                        format!("failed to serialize table '{}' for encryption", table),
                    )
                    .with_cause(e)
                })?;
                let envelope = self.crypto.encrypt(&plaintext, &key)?;
                let mut marker = Record::new();
                marker.insert(ENC_MARKER.to_string(), Value::String(envelope));
                Ok(vec![marker])
            }
        }
    }

    /// Append records as one envelope each (`__enc_bulk`). A true append
    /// for whole-record encryption: existing chunks stay untouched.
    pub fn insert_batched(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        let key = self.master_key()?;
        let payloads: Vec<String> = records
            .iter()
            .map(|r| {
                serde_json::to_string(r).map_err(|e| {
                    StoreError::new(ErrorCode::EncryptFailed, "record is not serializable")
                        .with_cause(e)
                })
            })
            .collect::<Result<_>>()?;
        let envelopes = self.crypto.encrypt_bulk(&payloads, &key)?;

        let stored: Vec<Record> = envelopes
            .into_iter()
            .map(|envelope| {
                let mut record = Record::new();
                record.insert(ENC_BULK_MARKER.to_string(), Value::String(envelope));
                record
            })
            .collect();

        let written = self.inner.insert(table, stored)?;
        self.invalidate_plain(table);
        Ok(written)
    }

    /// Replace a table's logical content through the encrypted write path
    fn write_plain(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        let count = records.len();
        let stored = self.encrypt_records(table, records)?;
        self.inner.overwrite(table, stored)?;
        self.invalidate_plain(table);
        Ok(count)
    }

    /// Drop cached plaintext and the session key (e.g. on lock-screen)
    pub fn clear_sensitive_state(&self) {
        self.plaintext
            .lock()
            .expect("plaintext cache lock poisoned")
            .clear();
        *self.session_key.lock().expect("session key lock poisoned") = None;
    }

    /// Stop the key-cache janitor and drop key material
    pub fn close(&self) -> Result<()> {
        self.crypto.shutdown();
        self.clear_sensitive_state();
        self.inner.close()
    }
}

impl Store for EncryptedEngine {
    fn create_table(&self, table: &str, mut options: CreateTableOptions) -> Result<()> {
        if !options.encrypted_fields.is_empty() {
            self.set_table_mode(
                table,
                EncryptionMode::FieldLevel(options.encrypted_fields.clone()),
            );
        }
        // Initial data must flow through the encrypted write path.
        let initial = std::mem::take(&mut options.initial_data);
        self.inner.create_table(table, options)?;
        if !initial.is_empty() {
            self.insert(table, initial)?;
        }
        Ok(())
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        self.invalidate_plain(table);
        self.modes.write().expect("mode lock poisoned").remove(table);
        self.inner.delete_table(table)
    }

    fn has_table(&self, table: &str) -> bool {
        self.inner.has_table(table)
    }

    fn list_tables(&self) -> Vec<String> {
        self.inner.list_tables()
    }

    fn insert(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        match self.table_mode(table) {
            EncryptionMode::FieldLevel(_) => {
                let count = records.len();
                let stored = self.encrypt_records(table, records)?;
                self.inner.insert(table, stored)?;
                self.invalidate_plain(table);
                Ok(count)
            }
            EncryptionMode::WholeTable => {
                // The expensive path: decrypt, merge, re-encrypt, rewrite.
                let mut plain = self.read_plain(table)?;
                plain.extend(records);
                self.write_plain(table, plain)
            }
        }
    }

    fn overwrite(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        self.write_plain(table, records)
    }

    fn read(&self, table: &str, options: ReadOptions) -> Result<Vec<Record>> {
        // Predicates run on plaintext; fetch everything, then filter.
        let plain = self.read_plain(table)?;
        Ok(apply_read_options(plain, &options))
    }

    fn count(&self, table: &str) -> Result<usize> {
        if !self.inner.has_table(table) {
            return Err(StoreError::table_not_found(table));
        }
        // The stored count misstates whole-table layouts; count logical
        // records instead.
        Ok(self.read_plain(table)?.len())
    }

    fn verify_count(&self, table: &str) -> Result<CountVerification> {
        if !self.inner.has_table(table) {
            return Err(StoreError::table_not_found(table));
        }
        let metadata = self.inner.count(table)?;
        let actual = self.read_plain(table)?.len();
        Ok(CountVerification {
            metadata,
            actual,
            matches: metadata == actual,
        })
    }

    fn find_one(&self, table: &str, filter: Filter) -> Result<Option<Record>> {
        let mut found = self.read(
            table,
            ReadOptions {
                filter: Some(filter),
                limit: Some(1),
                ..Default::default()
            },
        )?;
        Ok(found.pop())
    }

    fn find_many(
        &self,
        table: &str,
        filter: Option<Filter>,
        options: ReadOptions,
    ) -> Result<Vec<Record>> {
        self.read(table, ReadOptions { filter, ..options })
    }

    fn update(&self, table: &str, data: Value, filter: Filter) -> Result<usize> {
        if !self.inner.has_table(table) {
            return Err(StoreError::table_not_found(table));
        }
        let mut plain = self.read_plain(table)?;
        let mut modified = 0usize;
        for record in plain.iter_mut() {
            if filter.matches(record) {
                crate::engine::writer::apply_update(record, &data);
                modified += 1;
            }
        }
        if modified > 0 {
            self.write_plain(table, plain)?;
        }
        Ok(modified)
    }

    fn delete(&self, table: &str, filter: Filter) -> Result<usize> {
        if !self.inner.has_table(table) {
            return Err(StoreError::table_not_found(table));
        }
        let plain = self.read_plain(table)?;
        let before = plain.len();
        let remaining: Vec<Record> = plain.into_iter().filter(|r| !filter.matches(r)).collect();
        let removed = before - remaining.len();
        if removed > 0 {
            self.write_plain(table, remaining)?;
        }
        Ok(removed)
    }

    fn clear_table(&self, table: &str) -> Result<()> {
        self.invalidate_plain(table);
        self.inner.clear_table(table)
    }

    fn bulk_write(&self, table: &str, ops: Vec<BulkOp>) -> Result<BulkSummary> {
        if !self.inner.has_table(table) {
            return Err(StoreError::table_not_found(table));
        }
        let mut plain = self.read_plain(table)?;
        let mut summary = BulkSummary::default();

        for op in &ops {
            match op {
                BulkOp::Insert { records } => {
                    plain.extend(records.iter().cloned());
                    summary.inserted += records.len();
                }
                BulkOp::Update { data, filter } => {
                    for record in plain.iter_mut() {
                        if filter.matches(record) {
                            crate::engine::writer::apply_update(record, data);
                            summary.updated += 1;
                        }
                    }
                }
                BulkOp::Delete { filter } => {
                    let before = plain.len();
                    plain.retain(|r| !filter.matches(r));
                    summary.deleted += before - plain.len();
                }
            }
        }

        self.write_plain(table, plain).map_err(|e| {
            StoreError::new(
                ErrorCode::BulkOperationFailed,
                format!("encrypted bulk write on '{}' failed", table),
            )
            .with_cause(e)
        })?;
        Ok(summary)
    }

    fn begin_transaction(&self) -> Result<()> {
        self.inner.begin_transaction()
    }

    fn commit(&self) -> Result<()> {
        let result = self.inner.commit();
        // Queued writes landed (or rolled back); cached plaintext is stale
        // either way.
        self.plaintext
            .lock()
            .expect("plaintext cache lock poisoned")
            .clear();
        result
    }

    fn rollback(&self) -> Result<()> {
        let result = self.inner.rollback();
        self.plaintext
            .lock()
            .expect("plaintext cache lock poisoned")
            .clear();
        result
    }
}
