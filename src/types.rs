//! Core types for litestore
//!
//! Defines records, record ids, storage modes, table schemas, and the total
//! ordering over JSON values that sorting and index keys rely on.
//!
//! A record is a plain JSON object. The field `id` (string or integer) is
//! the primary key when present; the engine neither generates nor enforces
//! ids, and operations degrade gracefully when `id` is absent (no index
//! updates, no by-id matching).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored document: field name -> JSON value
pub type Record = serde_json::Map<String, Value>;

/// Current unix time in milliseconds
pub(crate) fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Primary key of a record. Integers order before strings so that mixed-id
/// tables still paginate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Extract an id from a JSON value; non-id-shaped values yield None
    pub fn from_value(value: &Value) -> Option<RecordId> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            Value::String(s) => Some(RecordId::Str(s.clone())),
            _ => None,
        }
    }

    /// The id of a record, when its `id` field is id-shaped
    pub fn of_record(record: &Record) -> Option<RecordId> {
        record.get("id").and_then(RecordId::from_value)
    }

    /// Back to the JSON representation
    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(n) => Value::from(*n),
            RecordId::Str(s) => Value::from(s.clone()),
        }
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RecordId::Int(a), RecordId::Int(b)) => a.cmp(b),
            (RecordId::Str(a), RecordId::Str(b)) => a.cmp(b),
            (RecordId::Int(_), RecordId::Str(_)) => Ordering::Less,
            (RecordId::Str(_), RecordId::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{}", n),
            RecordId::Str(s) => write!(f, "{}", s),
        }
    }
}

/// How a table is laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// One JSON array in `<name>.ldb`
    Single,
    /// Numbered chunk files under `<name>/`
    Chunked,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Single
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Single => write!(f, "single"),
            StorageMode::Chunked => write!(f, "chunked"),
        }
    }
}

/// Whether a write replaces the table or appends to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Overwrite,
}

/// Column type hint. Either a bare type name or a type with a high-risk
/// marker; types are advisory, never enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Type(String),
    Detailed {
        #[serde(rename = "type")]
        type_name: String,
        #[serde(rename = "isHighRisk", default)]
        is_high_risk: bool,
    },
}

impl ColumnSpec {
    pub fn type_name(&self) -> &str {
        match self {
            ColumnSpec::Type(t) => t,
            ColumnSpec::Detailed { type_name, .. } => type_name,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        matches!(self, ColumnSpec::Detailed { is_high_risk: true, .. })
    }
}

/// Kind of an in-memory index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Normal,
    Unique,
}

/// Catalog entry for one table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Storage layout
    #[serde(default)]
    pub mode: StorageMode,
    /// Path relative to the store root (`users.ldb` or `users/`)
    pub path: String,
    /// Advisory record count; the record array is authoritative
    #[serde(default)]
    pub count: usize,
    /// Approximate serialized size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Number of chunk files (chunked mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u32>,
    /// Unix millis of creation
    pub created_at: u64,
    /// Unix millis of last catalog-visible mutation
    pub updated_at: u64,
    /// Column type hints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Declared indexes, rebuilt from data on first use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<BTreeMap<String, IndexKind>>,
    /// Bypass the cache for every read of this table
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_high_risk: bool,
    /// Fields that demand fresh reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_risk_fields: Option<Vec<String>>,
    /// Fields the encrypted adapter protects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_fields: Option<Vec<String>>,
}

impl TableSchema {
    /// A fresh schema for a table created now
    pub fn new(path: String, mode: StorageMode) -> Self {
        let now = now_millis();
        Self {
            mode,
            path,
            count: 0,
            size: None,
            chunks: None,
            created_at: now,
            updated_at: now,
            columns: BTreeMap::new(),
            indexes: None,
            is_high_risk: false,
            high_risk_fields: None,
            encrypted_fields: None,
        }
    }

    /// True when any column carries a high-risk marker
    pub fn has_high_risk_columns(&self) -> bool {
        self.is_high_risk
            || self.columns.values().any(|c| c.is_high_risk())
            || self
                .high_risk_fields
                .as_ref()
                .map(|f| !f.is_empty())
                .unwrap_or(false)
    }
}

/// Partial schema update merged into a catalog entry
#[derive(Debug, Clone, Default)]
pub struct SchemaPatch {
    pub mode: Option<StorageMode>,
    pub path: Option<String>,
    pub count: Option<usize>,
    pub size: Option<u64>,
    pub chunks: Option<u32>,
    pub columns: Option<BTreeMap<String, ColumnSpec>>,
    pub indexes: Option<BTreeMap<String, IndexKind>>,
    pub is_high_risk: Option<bool>,
    pub high_risk_fields: Option<Vec<String>>,
    pub encrypted_fields: Option<Vec<String>>,
}

impl SchemaPatch {
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Default::default()
        }
    }

    /// Merge into an existing schema, touching `updated_at`
    pub fn apply_to(self, schema: &mut TableSchema) {
        if let Some(mode) = self.mode {
            schema.mode = mode;
        }
        if let Some(path) = self.path {
            schema.path = path;
        }
        if let Some(count) = self.count {
            schema.count = count;
        }
        if let Some(size) = self.size {
            schema.size = Some(size);
        }
        if let Some(chunks) = self.chunks {
            schema.chunks = Some(chunks);
        }
        if let Some(columns) = self.columns {
            schema.columns = columns;
        }
        if let Some(indexes) = self.indexes {
            schema.indexes = Some(indexes);
        }
        if let Some(hr) = self.is_high_risk {
            schema.is_high_risk = hr;
        }
        if let Some(fields) = self.high_risk_fields {
            schema.high_risk_fields = Some(fields);
        }
        if let Some(fields) = self.encrypted_fields {
            schema.encrypted_fields = Some(fields);
        }
        schema.updated_at = now_millis();
    }
}

/// Rank of a JSON value in the total order: Null < Bool < Number < String
/// < Array < Object
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values. Cross-type comparisons order by type rank;
/// numbers compare numerically across integer/float representations;
/// arrays and objects compare by serialized form. NaN sorts below every
/// other number.
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::NEG_INFINITY);
            let fy = y.as_f64().unwrap_or(f64::NEG_INFINITY);
            fx.partial_cmp(&fy).unwrap_or_else(|| {
                // NaN handling: NaN < non-NaN, NaN == NaN
                match (fx.is_nan(), fy.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => Ordering::Equal,
                }
            })
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Equality under the strict-by-type rule: numbers compare numerically
/// across integer/float representations, everything else by exact value.
/// A number never equals a numeric-looking string.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(ix), Some(iy)) => ix == iy,
                _ => x.as_f64() == y.as_f64(),
            }
        }
        _ => a == b,
    }
}

/// Serialized-JSON length used for cache memory accounting and the
/// go-chunked heuristic
pub fn estimate_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
