//! Single-file table handler
//!
//! The whole table is one JSON array in `<name>.ldb`. Reads parse the full
//! file; writes serialize and atomically replace it. Writing an empty
//! array produces `[]`, not a deleted file.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ErrorCode, Result, StoreError};
use crate::io_util::{self, with_timeout};
use crate::types::Record;

/// Handle to one single-mode table file
pub struct SingleFileHandler {
    path: PathBuf,
    timeout: Duration,
}

impl SingleFileHandler {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Parse the record array. `None` when the file does not exist.
    pub fn read(&self) -> Result<Option<Vec<Record>>> {
        let path = self.path.clone();
        with_timeout("table file read", self.timeout, move || {
            let bytes = match io_util::read_if_exists(&path)? {
                Some(bytes) => bytes,
                None => return Ok(None),
            };
            let records: Vec<Record> = serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::new(
                    ErrorCode::FileContentInvalid,
                    format!("table file '{}' is not a JSON record array", path.display()),
                )
                .with_cause(e)
            })?;
            Ok(Some(records))
        })
    }

    /// Serialize and atomically replace the file
    pub fn write(&self, records: Vec<Record>) -> Result<()> {
        let path = self.path.clone();
        with_timeout("table file write", self.timeout, move || {
            let bytes = serde_json::to_vec(&records)?;
            io_util::atomic_write(&path, &bytes)
        })
    }

    /// Remove the file; a missing file is fine
    pub fn delete(&self) -> Result<()> {
        let path = self.path.clone();
        with_timeout("table file delete", self.timeout, move || {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
