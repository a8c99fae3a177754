//! In-memory index manager
//!
//! Per table, per field: a map from indexed value to the ordered set of
//! record ids holding that value. Indexes are a coarse pre-filter for the
//! read path (the full filter is always re-applied to the fetched records)
//! and are rebuilt from table data on first need; nothing is persisted.
//!
//! UNIQUE indexes allow at most one id per value and reject duplicates
//! loudly. Records without an `id` field are silently skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde_json::Value;

use crate::error::{ErrorCode, Result, StoreError};
use crate::types::{IndexKind, Record, RecordId};

/// Encode a JSON value as an index key with a type-discriminating prefix,
/// so values of different types never collide.
fn value_to_index_key(value: &Value) -> String {
    match value {
        Value::Null => "\0NULL".to_string(),
        Value::Bool(b) => format!("B{}", if *b { "1" } else { "0" }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => format!("I{:020}", i),
            None => format!("F{:020}", n.as_f64().unwrap_or(0.0).to_bits()),
        },
        Value::String(s) => format!("S{}", s),
        Value::Array(_) | Value::Object(_) => format!("J{}", value),
    }
}

/// One field's index data
struct FieldIndex {
    kind: IndexKind,
    entries: BTreeMap<String, BTreeSet<RecordId>>,
}

impl FieldIndex {
    fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, table: &str, field: &str, value: &Value, id: RecordId) -> Result<()> {
        let key = value_to_index_key(value);
        let ids = self.entries.entry(key).or_insert_with(BTreeSet::new);
        if self.kind == IndexKind::Unique && !ids.is_empty() && !ids.contains(&id) {
            return Err(StoreError::new(
                ErrorCode::TableUpdateFailed,
                format!(
                    "duplicate value for unique index on '{}.{}'",
                    table, field
                ),
            )
            .with_details(format!("value {}, record id {}", value, id)));
        }
        ids.insert(id);
        Ok(())
    }

    fn remove(&mut self, value: &Value, id: &RecordId) {
        let key = value_to_index_key(value);
        if let Some(ids) = self.entries.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn lookup(&self, value: &Value) -> Vec<RecordId> {
        self.entries
            .get(&value_to_index_key(value))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// All indexes, keyed by table then field
pub struct IndexManager {
    tables: RwLock<HashMap<String, HashMap<String, FieldIndex>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Build (or rebuild) an index over the given records. Fails on a
    /// unique violation, leaving no index behind.
    pub fn create_index(
        &self,
        table: &str,
        field: &str,
        kind: IndexKind,
        records: &[Record],
    ) -> Result<()> {
        let mut index = FieldIndex::new(kind);
        for record in records {
            let id = match RecordId::of_record(record) {
                Some(id) => id,
                None => continue,
            };
            if let Some(value) = record.get(field) {
                index.insert(table, field, value, id)?;
            }
        }

        self.tables
            .write()
            .expect("index lock poisoned")
            .entry(table.to_string())
            .or_insert_with(HashMap::new)
            .insert(field.to_string(), index);
        Ok(())
    }

    /// Drop one field's index
    pub fn drop_index(&self, table: &str, field: &str) {
        let mut tables = self.tables.write().expect("index lock poisoned");
        if let Some(fields) = tables.get_mut(table) {
            fields.remove(field);
            if fields.is_empty() {
                tables.remove(table);
            }
        }
    }

    /// Drop every index of a table (table deletion, bulk rewrites)
    pub fn drop_table(&self, table: &str) {
        self.tables
            .write()
            .expect("index lock poisoned")
            .remove(table);
    }

    /// The kind of index on a field, if one is built
    pub fn index_kind(&self, table: &str, field: &str) -> Option<IndexKind> {
        self.tables
            .read()
            .expect("index lock poisoned")
            .get(table)
            .and_then(|fields| fields.get(field))
            .map(|index| index.kind)
    }

    /// Whether any index exists for the table
    pub fn has_indexes(&self, table: &str) -> bool {
        self.tables
            .read()
            .expect("index lock poisoned")
            .contains_key(table)
    }

    /// Ids matching an equality probe on an indexed field. `None` when the
    /// field has no index (the caller falls back to a scan).
    pub fn lookup(&self, table: &str, field: &str, value: &Value) -> Option<Vec<RecordId>> {
        self.tables
            .read()
            .expect("index lock poisoned")
            .get(table)
            .and_then(|fields| fields.get(field))
            .map(|index| index.lookup(value))
    }

    /// Index a newly inserted record across every indexed field it carries
    pub fn add_record(&self, table: &str, record: &Record) -> Result<()> {
        let id = match RecordId::of_record(record) {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut tables = self.tables.write().expect("index lock poisoned");
        if let Some(fields) = tables.get_mut(table) {
            for (field, index) in fields.iter_mut() {
                if let Some(value) = record.get(field) {
                    index.insert(table, field, value, id.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Remove a record from every index that covers it
    pub fn remove_record(&self, table: &str, record: &Record) {
        let id = match RecordId::of_record(record) {
            Some(id) => id,
            None => return,
        };
        let mut tables = self.tables.write().expect("index lock poisoned");
        if let Some(fields) = tables.get_mut(table) {
            for (field, index) in fields.iter_mut() {
                if let Some(value) = record.get(field) {
                    index.remove(value, &id);
                }
            }
        }
    }

    /// Re-index a record after an in-place update
    pub fn update_record(&self, table: &str, old: &Record, new: &Record) -> Result<()> {
        self.remove_record(table, old);
        self.add_record(table, new)
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn sample() -> Vec<Record> {
        vec![
            record(json!({"id": 1, "email": "a@x.io", "team": "red"})),
            record(json!({"id": 2, "email": "b@x.io", "team": "red"})),
            record(json!({"id": 3, "email": "c@x.io", "team": "blue"})),
        ]
    }

    #[test]
    fn test_normal_index_lookup() {
        let indexes = IndexManager::new();
        indexes
            .create_index("users", "team", IndexKind::Normal, &sample())
            .unwrap();

        let reds = indexes.lookup("users", "team", &json!("red")).unwrap();
        assert_eq!(reds, vec![RecordId::Int(1), RecordId::Int(2)]);

        assert!(indexes.lookup("users", "team", &json!("green")).unwrap().is_empty());
        assert!(indexes.lookup("users", "email", &json!("a@x.io")).is_none());
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let indexes = IndexManager::new();
        indexes
            .create_index("users", "email", IndexKind::Unique, &sample())
            .unwrap();

        let dup = record(json!({"id": 9, "email": "a@x.io"}));
        let err = indexes.add_record("users", &dup).unwrap_err();
        assert_eq!(err.code, ErrorCode::TableUpdateFailed);
        assert!(err.message.contains("unique"));
    }

    #[test]
    fn test_unique_build_fails_on_duplicate_data() {
        let indexes = IndexManager::new();
        let mut records = sample();
        records.push(record(json!({"id": 4, "email": "a@x.io"})));

        let err = indexes
            .create_index("users", "email", IndexKind::Unique, &records)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TableUpdateFailed);
    }

    #[test]
    fn test_records_without_id_are_skipped() {
        let indexes = IndexManager::new();
        let records = vec![record(json!({"email": "ghost@x.io"}))];
        indexes
            .create_index("users", "email", IndexKind::Unique, &records)
            .unwrap();
        assert!(indexes.lookup("users", "email", &json!("ghost@x.io")).unwrap().is_empty());

        // add/remove of id-less records are no-ops
        indexes.add_record("users", &record(json!({"email": "x@x.io"}))).unwrap();
        indexes.remove_record("users", &record(json!({"email": "x@x.io"})));
    }

    #[test]
    fn test_update_record_moves_index_entry() {
        let indexes = IndexManager::new();
        indexes
            .create_index("users", "team", IndexKind::Normal, &sample())
            .unwrap();

        let old = record(json!({"id": 1, "team": "red"}));
        let new = record(json!({"id": 1, "team": "blue"}));
        indexes.update_record("users", &old, &new).unwrap();

        assert_eq!(
            indexes.lookup("users", "team", &json!("red")).unwrap(),
            vec![RecordId::Int(2)]
        );
        let mut blues = indexes.lookup("users", "team", &json!("blue")).unwrap();
        blues.sort();
        assert_eq!(blues, vec![RecordId::Int(1), RecordId::Int(3)]);
    }

    #[test]
    fn test_values_of_different_types_never_collide() {
        let indexes = IndexManager::new();
        let records = vec![
            record(json!({"id": 1, "v": 1})),
            record(json!({"id": 2, "v": "1"})),
            record(json!({"id": 3, "v": true})),
        ];
        indexes
            .create_index("t", "v", IndexKind::Normal, &records)
            .unwrap();

        assert_eq!(indexes.lookup("t", "v", &json!(1)).unwrap(), vec![RecordId::Int(1)]);
        assert_eq!(indexes.lookup("t", "v", &json!("1")).unwrap(), vec![RecordId::Int(2)]);
        assert_eq!(indexes.lookup("t", "v", &json!(true)).unwrap(), vec![RecordId::Int(3)]);
    }

    #[test]
    fn test_drop_index_and_table() {
        let indexes = IndexManager::new();
        indexes
            .create_index("users", "team", IndexKind::Normal, &sample())
            .unwrap();
        assert!(indexes.has_indexes("users"));

        indexes.drop_index("users", "team");
        assert!(!indexes.has_indexes("users"));

        indexes
            .create_index("users", "team", IndexKind::Normal, &sample())
            .unwrap();
        indexes.drop_table("users");
        assert!(!indexes.has_indexes("users"));
    }
}
