//! Write path
//!
//! Validates input, resolves the table's storage mode, delegates to the
//! file handler, and keeps the catalog, cache and indexes in step with
//! every mutation. Update and delete are read-modify-write: load the
//! array, mutate in memory, write back in overwrite mode. The bulk path
//! applies a whole op list against one read and one write.

use serde_json::Value;

use crate::error::{ErrorCode, Result, StoreError};
use crate::files::{self, FileHandler};
use crate::query::Filter;
use crate::types::{
    estimate_size, Record, RecordId, SchemaPatch, StorageMode, TableSchema, WriteMode,
};

use super::transaction::{BulkOp, QueuedOp};
use super::Engine;

/// Reject empty, whitespace-only, path-escaping and oversized names
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.trim().is_empty() {
        return Err(StoreError::table_name_invalid(name, "name is empty"));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(StoreError::table_name_invalid(
            name,
            "contains forbidden characters",
        ));
    }
    if name.len() > 255 {
        return Err(StoreError::table_name_invalid(name, "name too long"));
    }
    Ok(())
}

/// Merge an update document into a record. A document whose keys start
/// with `$` is an operator update (`$set`, `$inc`, `$push`, `$pull`);
/// anything else is a plain merge that overwrites the named fields.
pub(crate) fn apply_update(record: &mut Record, data: &Value) {
    let obj = match data.as_object() {
        Some(obj) => obj,
        None => return,
    };

    let operator_mode = obj.keys().any(|k| k.starts_with('$'));
    if !operator_mode {
        for (field, value) in obj {
            record.insert(field.clone(), value.clone());
        }
        return;
    }

    for (op, spec) in obj {
        let spec_obj = match spec.as_object() {
            Some(o) => o,
            None => continue,
        };
        match op.as_str() {
            "$set" => {
                for (field, value) in spec_obj {
                    record.insert(field.clone(), value.clone());
                }
            }
            "$inc" => {
                for (field, delta) in spec_obj {
                    let delta = delta.as_f64().unwrap_or(0.0);
                    let current = record.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                    let next = current + delta;
                    // Keep integer shape when both sides are integral.
                    let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                        Value::from(next as i64)
                    } else {
                        Value::from(next)
                    };
                    record.insert(field.clone(), value);
                }
            }
            "$push" => {
                for (field, value) in spec_obj {
                    match record.get_mut(field) {
                        Some(Value::Array(items)) => items.push(value.clone()),
                        _ => {
                            record.insert(field.clone(), Value::Array(vec![value.clone()]));
                        }
                    }
                }
            }
            "$pull" => {
                for (field, value) in spec_obj {
                    if let Some(Value::Array(items)) = record.get_mut(field) {
                        items.retain(|item| !crate::types::value_eq(item, value));
                    }
                }
            }
            other => {
                log::warn!("ignoring unsupported update operator '{}'", other);
            }
        }
    }
}

/// Outcome of a bulk write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl BulkSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

impl Engine {
    /// Append records to a table, creating it on first write
    pub fn insert(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        if self.txn.is_active() {
            let count = records.len();
            self.txn.queue(
                table,
                QueuedOp::Write {
                    records,
                    mode: WriteMode::Append,
                },
                || self.txn_snapshot(table),
            )?;
            return Ok(count);
        }
        self.direct_write(table, records, WriteMode::Append)
    }

    /// Replace a table's contents, creating it on first write
    pub fn overwrite(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        if self.txn.is_active() {
            let count = records.len();
            self.txn.queue(
                table,
                QueuedOp::Write {
                    records,
                    mode: WriteMode::Overwrite,
                },
                || self.txn_snapshot(table),
            )?;
            return Ok(count);
        }
        self.direct_write(table, records, WriteMode::Overwrite)
    }

    /// Mode-switched shim kept for callers of the old surface
    #[deprecated(note = "use insert() or overwrite()")]
    pub fn write(&self, table: &str, records: Vec<Record>, mode: WriteMode) -> Result<usize> {
        match mode {
            WriteMode::Append => self.insert(table, records),
            WriteMode::Overwrite => self.overwrite(table, records),
        }
    }

    /// The escape hatch every internal writer uses: bypasses transaction
    /// gating, writes through the file handler, then settles the catalog,
    /// cache and indexes.
    pub(crate) fn direct_write(
        &self,
        table: &str,
        records: Vec<Record>,
        mode: WriteMode,
    ) -> Result<usize> {
        validate_table_name(table)?;

        let schema = match self.catalog.get(table) {
            Some(schema) => schema,
            None => self.auto_create_schema(table, &records)?,
        };

        let handler = self.file_handler(table, schema.mode);
        let written = records.len();

        if mode == WriteMode::Append && self.indexes.has_indexes(table) {
            self.check_unique_conflicts(table, &records)?;
        }

        let chunks = match mode {
            WriteMode::Append => handler.append(records.clone())?,
            WriteMode::Overwrite => handler.write(records.clone())?,
        };

        let count = match mode {
            WriteMode::Append => schema.count + written,
            WriteMode::Overwrite => written,
        };
        let mut patch = SchemaPatch::count(count);
        if schema.mode == StorageMode::Chunked {
            patch.chunks = Some(chunks);
        }
        let batch_size: u64 = records
            .iter()
            .map(|r| estimate_size(&Value::Object(r.clone())) as u64)
            .sum();
        patch.size = Some(match mode {
            WriteMode::Append => schema.size.unwrap_or(0) + batch_size,
            WriteMode::Overwrite => batch_size,
        });
        self.catalog.update(table, patch);

        self.invalidate_table_cache(table);

        match mode {
            WriteMode::Append => {
                for record in &records {
                    self.indexes.add_record(table, record)?;
                }
            }
            WriteMode::Overwrite => {
                // Rebuilt lazily from the new data on next indexed read.
                self.indexes.drop_table(table);
            }
        }
        Ok(written)
    }

    fn auto_create_schema(&self, table: &str, records: &[Record]) -> Result<TableSchema> {
        let mode = if files::should_use_chunked(records, self.chunk_threshold) {
            StorageMode::Chunked
        } else {
            StorageMode::Single
        };
        let path = match mode {
            StorageMode::Single => format!("{}.ldb", table),
            StorageMode::Chunked => format!("{}/", table),
        };
        let schema = TableSchema::new(path, mode);
        self.catalog.insert(table, schema.clone());
        log::debug!("auto-created table '{}' in {} mode", table, mode);
        Ok(schema)
    }

    /// Refuse an append that would violate a unique index, before any
    /// bytes hit disk. Also catches duplicates within the batch itself.
    fn check_unique_conflicts(&self, table: &str, records: &[Record]) -> Result<()> {
        let schema = match self.catalog.get(table) {
            Some(schema) => schema,
            None => return Ok(()),
        };
        let declared = match &schema.indexes {
            Some(indexes) => indexes,
            None => return Ok(()),
        };

        for (field, kind) in declared {
            if *kind != crate::types::IndexKind::Unique {
                continue;
            }
            let mut batch_seen: Vec<&Value> = Vec::new();
            for record in records {
                let value = match record.get(field) {
                    Some(v) => v,
                    None => continue,
                };
                let id = RecordId::of_record(record);
                let existing = self.indexes.lookup(table, field, value).unwrap_or_default();
                let conflict = existing
                    .iter()
                    .any(|existing_id| Some(existing_id) != id.as_ref());
                if conflict
                    || batch_seen
                        .iter()
                        .any(|seen| crate::types::value_eq(seen, value))
                {
                    return Err(StoreError::new(
                        ErrorCode::TableUpdateFailed,
                        format!("duplicate value for unique index on '{}.{}'", table, field),
                    )
                    .with_details(format!("value {}", value)));
                }
                batch_seen.push(value);
            }
        }
        Ok(())
    }

    /// Update every record matching `filter` with the update document.
    /// Returns the number of records modified. Inside a transaction the
    /// operation queues and returns 0; the count materializes at commit.
    pub fn update(&self, table: &str, data: Value, filter: Filter) -> Result<usize> {
        if self.txn.is_active() {
            self.txn.queue(
                table,
                QueuedOp::Update {
                    data,
                    filter,
                },
                || self.txn_snapshot(table),
            )?;
            return Ok(0);
        }

        let mut records = self.read_table_strict(table)?;
        let mut modified = 0usize;
        for record in records.iter_mut() {
            if filter.matches(record) {
                apply_update(record, &data);
                modified += 1;
            }
        }
        if modified > 0 {
            self.direct_write(table, records, WriteMode::Overwrite)?;
        }
        Ok(modified)
    }

    /// Delete every record matching `filter`. An empty filter matches all
    /// records, so `delete(t, Filter::all())` empties the table. Returns
    /// the number of records removed.
    pub fn delete(&self, table: &str, filter: Filter) -> Result<usize> {
        if self.txn.is_active() {
            self.txn.queue(
                table,
                QueuedOp::Delete { filter },
                || self.txn_snapshot(table),
            )?;
            return Ok(0);
        }

        let records = self.read_table_strict(table)?;
        let before = records.len();
        let remaining: Vec<Record> = records.into_iter().filter(|r| !filter.matches(r)).collect();
        let removed = before - remaining.len();
        if removed > 0 {
            self.direct_write(table, remaining, WriteMode::Overwrite)?;
        }
        Ok(removed)
    }

    /// Remove every record but keep the table and its schema
    pub fn clear_table(&self, table: &str) -> Result<()> {
        if !self.catalog.contains(table) {
            return Err(StoreError::table_not_found(table));
        }
        self.direct_write(table, Vec::new(), WriteMode::Overwrite)?;
        Ok(())
    }

    /// Apply a list of insert/update/delete ops with one table read and
    /// one table write. Inside a transaction the whole list queues and an
    /// empty summary is returned.
    pub fn bulk_write(&self, table: &str, ops: Vec<BulkOp>) -> Result<BulkSummary> {
        if self.txn.is_active() {
            self.txn.queue(
                table,
                QueuedOp::Bulk { ops },
                || self.txn_snapshot(table),
            )?;
            return Ok(BulkSummary::default());
        }

        let mut records = self.read_table_strict(table)?;
        let mut summary = BulkSummary::default();

        for op in &ops {
            match op {
                BulkOp::Insert { records: new } => {
                    records.extend(new.iter().cloned());
                    summary.inserted += new.len();
                }
                BulkOp::Update { data, filter } => {
                    for record in records.iter_mut() {
                        if filter.matches(record) {
                            apply_update(record, data);
                            summary.updated += 1;
                        }
                    }
                }
                BulkOp::Delete { filter } => {
                    let before = records.len();
                    records.retain(|r| !filter.matches(r));
                    summary.deleted += before - records.len();
                }
            }
        }

        self.direct_write(table, records, WriteMode::Overwrite)
            .map_err(|e| {
                StoreError::new(
                    ErrorCode::BulkOperationFailed,
                    format!("bulk write on '{}' failed", table),
                )
                .with_cause(e)
            })?;
        Ok(summary)
    }

    /// Write-back path: park records as dirty cache entries under
    /// `<table>_<id>` and let the auto-sync loop flush them. Records
    /// without an `id` cannot be keyed and are written through directly.
    pub fn write_deferred(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        validate_table_name(table)?;
        // Cached query results no longer reflect the table's logical state.
        // Invalidate before parking the dirty entries so a registered
        // `<table>_<id>` read key cannot take a fresh dirty entry with it.
        self.invalidate_table_cache(table);

        let mut passthrough = Vec::new();
        let mut deferred = 0usize;

        for record in records {
            match RecordId::of_record(&record) {
                Some(id) => {
                    let key = format!("{}_{}", table, id);
                    self.cache.set(&key, Value::Object(record), None, true)?;
                    deferred += 1;
                }
                None => passthrough.push(record),
            }
        }

        if !passthrough.is_empty() {
            self.direct_write(table, passthrough, WriteMode::Append)?;
        }
        Ok(deferred)
    }

    /// Drop every cached read result recorded for the table. Precise: only
    /// keys from the per-table registry are touched, so dirty write-back
    /// entries survive.
    pub(crate) fn invalidate_table_cache(&self, table: &str) {
        let keys: Vec<String> = {
            let mut registry = self.cache_keys.lock().expect("cache key registry poisoned");
            registry.remove(table).map(|set| set.into_iter().collect()).unwrap_or_default()
        };
        for key in keys {
            // Dirty entries are pending writes, never invalidation fodder.
            self.cache.invalidate_clean(&key);
        }
    }

    /// Record a cache key so invalidation can be precise
    pub(crate) fn track_cache_key(&self, table: &str, key: &str) {
        self.cache_keys
            .lock()
            .expect("cache key registry poisoned")
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub(crate) fn file_handler(&self, table: &str, mode: StorageMode) -> FileHandler {
        FileHandler::open(&self.root, table, mode, self.chunk_threshold, self.io_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("users").is_ok());
        assert!(validate_table_name("my_table_123").is_ok());

        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("   ").is_err());
        assert!(validate_table_name("../etc/passwd").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name("a\\b").is_err());
        assert!(validate_table_name("a\0b").is_err());
        assert!(validate_table_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_apply_update_plain_merge() {
        let mut r = record(json!({"id": 1, "name": "a", "age": 30}));
        apply_update(&mut r, &json!({"name": "b", "city": "x"}));
        assert_eq!(r["name"], json!("b"));
        assert_eq!(r["city"], json!("x"));
        assert_eq!(r["age"], json!(30));
    }

    #[test]
    fn test_apply_update_set_and_inc() {
        let mut r = record(json!({"id": 1, "score": 10}));
        apply_update(&mut r, &json!({"$set": {"level": 2}, "$inc": {"score": 5}}));
        assert_eq!(r["level"], json!(2));
        assert_eq!(r["score"], json!(15));

        // $inc on a missing field starts from zero.
        apply_update(&mut r, &json!({"$inc": {"bonus": 3}}));
        assert_eq!(r["bonus"], json!(3));

        // Fractional increments keep float shape.
        apply_update(&mut r, &json!({"$inc": {"score": 0.5}}));
        assert_eq!(r["score"], json!(15.5));
    }

    #[test]
    fn test_apply_update_push_and_pull() {
        let mut r = record(json!({"id": 1, "tags": ["a"]}));
        apply_update(&mut r, &json!({"$push": {"tags": "b", "history": 1}}));
        assert_eq!(r["tags"], json!(["a", "b"]));
        assert_eq!(r["history"], json!([1]));

        apply_update(&mut r, &json!({"$pull": {"tags": "a"}}));
        assert_eq!(r["tags"], json!(["b"]));
    }

    #[test]
    fn test_bulk_summary_written() {
        let summary = BulkSummary {
            inserted: 2,
            updated: 3,
            deleted: 1,
        };
        assert_eq!(summary.written(), 6);
    }
}
