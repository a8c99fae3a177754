//! Table file handlers
//!
//! Two on-disk layouts share one dispatch type: a single-mode table is one
//! JSON array in `<name>.ldb`, a chunked table is a directory of numbered
//! `NNN.ldb` files that concatenate to the logical record sequence.

pub mod chunked;
pub mod single;

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::types::{estimate_size, Record, StorageMode};

pub use chunked::ChunkedFileHandler;
pub use single::SingleFileHandler;

/// Default rollover threshold for chunk files (bytes of serialized JSON)
pub const DEFAULT_CHUNK_THRESHOLD: usize = 512 * 1024;

/// Mode-dispatched handle to one table's files
pub enum FileHandler {
    Single(SingleFileHandler),
    Chunked(ChunkedFileHandler),
}

impl FileHandler {
    /// Open the handler matching a table's storage mode
    pub fn open(
        root: &Path,
        table: &str,
        mode: StorageMode,
        chunk_threshold: usize,
        timeout: Duration,
    ) -> Self {
        match mode {
            StorageMode::Single => FileHandler::Single(SingleFileHandler::new(
                root.join(format!("{}.ldb", table)),
                timeout,
            )),
            StorageMode::Chunked => FileHandler::Chunked(ChunkedFileHandler::new(
                root.join(table),
                chunk_threshold,
                timeout,
            )),
        }
    }

    /// Read the full record array. `None` means the file/directory does not
    /// exist; the reader decides whether that is `[]` or an error.
    pub fn read(&self) -> Result<Option<Vec<Record>>> {
        match self {
            FileHandler::Single(h) => h.read(),
            FileHandler::Chunked(h) => h.read_all(),
        }
    }

    /// Replace the table's contents. Returns the chunk count (1 for single
    /// mode) for catalog bookkeeping.
    pub fn write(&self, records: Vec<Record>) -> Result<u32> {
        match self {
            FileHandler::Single(h) => {
                h.write(records)?;
                Ok(1)
            }
            FileHandler::Chunked(h) => h.write(records),
        }
    }

    /// Append records, preserving existing content. Returns the chunk count.
    pub fn append(&self, records: Vec<Record>) -> Result<u32> {
        match self {
            FileHandler::Single(h) => {
                let mut all = h.read()?.unwrap_or_default();
                all.extend(records);
                h.write(all)?;
                Ok(1)
            }
            FileHandler::Chunked(h) => h.append(records),
        }
    }

    /// Remove the table's files entirely
    pub fn delete(&self) -> Result<()> {
        match self {
            FileHandler::Single(h) => h.delete(),
            FileHandler::Chunked(h) => h.delete(),
        }
    }

    /// Whether the backing file or directory exists
    pub fn exists(&self) -> bool {
        match self {
            FileHandler::Single(h) => h.exists(),
            FileHandler::Chunked(h) => h.exists(),
        }
    }
}

/// Table-creation heuristic: go chunked when the initial payload is already
/// half a chunk's worth of serialized JSON.
pub fn should_use_chunked(records: &[Record], chunk_threshold: usize) -> bool {
    let mut total = 2; // brackets
    for record in records {
        total += estimate_size(&serde_json::Value::Object(record.clone())) + 1;
        if total > chunk_threshold / 2 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_should_use_chunked_small_payload() {
        let records = vec![record(json!({"id": 1, "name": "A"}))];
        assert!(!should_use_chunked(&records, DEFAULT_CHUNK_THRESHOLD));
    }

    #[test]
    fn test_should_use_chunked_large_payload() {
        let blob = "x".repeat(600);
        let records: Vec<Record> = (0..100)
            .map(|i| record(json!({"id": i, "blob": blob})))
            .collect();
        // ~60 KB of payload against a 100 KB threshold: crosses the half mark.
        assert!(should_use_chunked(&records, 100 * 1024));
    }
}
