//! Read path
//!
//! Order of authority for a read: the active transaction's current view,
//! then the cache, then the files. Dirty write-back entries overlay the
//! disk state (they are the authoritative value until flushed). An
//! applicable single-field equality filter narrows the candidate set
//! through the index manager before the full filter runs.

use std::collections::HashSet;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::query::{apply_read_options, Filter, ReadOptions};
use crate::types::{Record, RecordId, TableSchema};

use super::Engine;

/// Outcome of [`Engine::verify_count`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountVerification {
    /// The catalog's advisory count
    pub metadata: usize,
    /// The record array length on disk
    pub actual: usize,
    pub matches: bool,
}

/// Short hex digest used as the query-key suffix. Underscore-free, so the
/// `<table>_<suffix>` grouping contract holds.
fn fingerprint_digest(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

impl Engine {
    /// Read records with filter, sort and pagination. Soft: an unknown
    /// table reads as empty.
    pub fn read(&self, table: &str, options: ReadOptions) -> Result<Vec<Record>> {
        if self.txn.is_active() {
            let view = self
                .txn
                .current_view(table, || self.read_from_disk(table))?;
            return Ok(apply_read_options(view, &options));
        }

        let schema = match self.catalog.get(table) {
            Some(schema) => schema,
            None => return Ok(Vec::new()),
        };

        let bypass = options.bypass_cache || schema.has_high_risk_columns();
        let cache_key = if bypass {
            None
        } else {
            options
                .fingerprint()
                .map(|fp| format!("{}_q{}", table, fingerprint_digest(&fp)))
        };

        if let Some(key) = &cache_key {
            if let Some(Value::Array(cached)) = self.cache.get(key) {
                return Ok(cached
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(record) => Some(record),
                        _ => None,
                    })
                    .collect());
            }
        }

        let mut records = self.read_with_schema(table, &schema)?;
        let overlaid = self.overlay_dirty(table, &mut records);

        // Index narrowing is safe only when the index can see every
        // record; pending write-back entries are not indexed.
        if !overlaid {
            if let Some(filter) = &options.filter {
                self.narrow_by_index(table, &schema, filter, &mut records)?;
            }
        }

        let result = apply_read_options(records, &options);

        if let Some(key) = &cache_key {
            let value = Value::Array(result.iter().cloned().map(Value::Object).collect());
            match self.cache.set(key, value, Some(self.result_ttl), false) {
                Ok(()) => self.track_cache_key(table, key),
                Err(e) => log::debug!("skipping result cache for '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    /// First record matching the filter, by ascending `id` when several
    /// match. Soft: unknown table yields `None`.
    pub fn find_one(&self, table: &str, filter: Filter) -> Result<Option<Record>> {
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

    /// Records matching the filter, with an optional window
    pub fn find_many(&self, table: &str, filter: Option<Filter>, options: ReadOptions) -> Result<Vec<Record>> {
        self.read(
            table,
            ReadOptions {
                filter,
                ..options
            },
        )
    }

    /// Point lookup through the per-id cache (`<table>_<id>`). A pending
    /// write-back entry under that key is the authoritative value and is
    /// returned as-is.
    pub fn find_by_id(&self, table: &str, id: &RecordId) -> Result<Option<Record>> {
        let high_risk = self
            .catalog
            .get(table)
            .map(|s| s.has_high_risk_columns())
            .unwrap_or(false);
        if self.txn.is_active() || high_risk {
            return self.find_one(table, Filter::eq("id", id.to_value()));
        }

        let key = format!("{}_{}", table, id);
        let loaded = self.cache.get_or_load(&key, Some(self.result_ttl), || {
            let records = self.read_from_disk(table)?;
            Ok(records
                .into_iter()
                .find(|r| RecordId::of_record(r).as_ref() == Some(id))
                .map(Value::Object))
        })?;
        if loaded.is_some() {
            self.track_cache_key(table, &key);
        }

        Ok(loaded.and_then(|v| match v {
            Value::Object(record) => Some(record),
            _ => None,
        }))
    }

    /// The catalog's advisory count. Strict: unknown table is an error.
    pub fn count(&self, table: &str) -> Result<usize> {
        self.catalog
            .count(table)
            .ok_or_else(|| StoreError::table_not_found(table))
    }

    /// Compare the advisory count against the on-disk record array.
    /// Strict: unknown table is an error.
    pub fn verify_count(&self, table: &str) -> Result<CountVerification> {
        let metadata = self
            .catalog
            .count(table)
            .ok_or_else(|| StoreError::table_not_found(table))?;
        let actual = self.read_from_disk(table)?.len();
        if metadata != actual {
            log::warn!(
                "count divergence on '{}': catalog {} vs actual {}",
                table,
                metadata,
                actual
            );
        }
        Ok(CountVerification {
            metadata,
            actual,
            matches: metadata == actual,
        })
    }

    /// Raw disk read in catalog mode; unknown tables and missing files
    /// read as empty. No cache, no dirty overlay, no transaction view.
    pub(crate) fn read_from_disk(&self, table: &str) -> Result<Vec<Record>> {
        match self.catalog.get(table) {
            Some(schema) => self.read_with_schema(table, &schema),
            None => Ok(Vec::new()),
        }
    }

    fn read_with_schema(&self, table: &str, schema: &TableSchema) -> Result<Vec<Record>> {
        let handler = self.file_handler(table, schema.mode);
        match handler.read()? {
            Some(records) => Ok(records),
            None => {
                // Catalog entry without files: an in-flight create or a
                // partially deleted table. Treat as empty.
                log::warn!("table '{}' is cataloged but has no files", table);
                Ok(Vec::new())
            }
        }
    }

    /// Pre-transaction snapshot of a table: `None` when the table does
    /// not exist, so rollback can remove it instead of restoring records.
    pub(crate) fn txn_snapshot(&self, table: &str) -> Result<Option<Vec<Record>>> {
        if !self.catalog.contains(table) {
            return Ok(None);
        }
        self.read_from_disk(table).map(Some)
    }

    /// Strict variant used by update/delete: unknown table is an error
    pub(crate) fn read_table_strict(&self, table: &str) -> Result<Vec<Record>> {
        if !self.catalog.contains(table) {
            return Err(StoreError::table_not_found(table));
        }
        self.read_from_disk(table)
    }

    /// Merge pending write-back entries over the disk records. Returns
    /// true when anything was overlaid.
    pub(crate) fn overlay_dirty(&self, table: &str, records: &mut Vec<Record>) -> bool {
        let prefix = format!("{}_", table);
        let mut overlaid = false;

        for (key, value) in self.cache.dirty_data() {
            // Key contract: table name is everything before the last '_'.
            let owner = match key.rfind('_') {
                Some(pos) => &key[..pos],
                None => continue,
            };
            if owner != table || !key.starts_with(&prefix) {
                continue;
            }
            let record = match value {
                Value::Object(record) => record,
                _ => continue,
            };
            overlaid = true;
            match RecordId::of_record(&record) {
                Some(id) => {
                    match records
                        .iter_mut()
                        .find(|r| RecordId::of_record(r).as_ref() == Some(&id))
                    {
                        Some(existing) => *existing = record,
                        None => records.push(record),
                    }
                }
                None => records.push(record),
            }
        }
        overlaid
    }

    /// Restrict the candidate set via an index when the filter is a
    /// single-field equality on a declared index. The full filter still
    /// runs afterwards; the index is a coarse pre-filter only.
    fn narrow_by_index(
        &self,
        table: &str,
        schema: &TableSchema,
        filter: &Filter,
        records: &mut Vec<Record>,
    ) -> Result<()> {
        let (field, value) = match filter.single_field_equality() {
            Some(probe) => probe,
            None => return Ok(()),
        };
        match &schema.indexes {
            Some(indexes) if indexes.contains_key(field) => {}
            _ => return Ok(()),
        }

        self.ensure_indexes(table, schema, records)?;

        if let Some(ids) = self.indexes.lookup(table, field, value) {
            let id_set: HashSet<RecordId> = ids.into_iter().collect();
            records.retain(|r| {
                RecordId::of_record(r)
                    .map(|id| id_set.contains(&id))
                    .unwrap_or(false)
            });
        }
        Ok(())
    }

    /// Build any declared index that is not in memory yet (first use after
    /// startup or after an overwrite dropped them).
    pub(crate) fn ensure_indexes(
        &self,
        table: &str,
        schema: &TableSchema,
        records: &[Record],
    ) -> Result<()> {
        let declared = match &schema.indexes {
            Some(indexes) => indexes,
            None => return Ok(()),
        };
        for (field, kind) in declared {
            if self.indexes.index_kind(table, field).is_none() {
                self.indexes.create_index(table, field, *kind, records)?;
            }
        }
        Ok(())
    }
}
