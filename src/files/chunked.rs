//! Chunked-file table handler
//!
//! A chunked table is a directory of numbered chunk files (`000.ldb`,
//! `001.ldb`, ...), each holding a JSON array. Chunk indexes increase
//! monotonically and reading them in numeric order reconstructs insertion
//! order. Appends fill the tail chunk up to the size threshold, then roll
//! over to a new chunk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorCode, Result, StoreError};
use crate::io_util::{self, with_timeout};
use crate::types::Record;

/// Handle to one chunked-mode table directory
pub struct ChunkedFileHandler {
    dir: PathBuf,
    /// Rollover threshold in bytes of serialized JSON per chunk
    chunk_threshold: usize,
    timeout: Duration,
}

impl ChunkedFileHandler {
    pub fn new(dir: PathBuf, chunk_threshold: usize, timeout: Duration) -> Self {
        Self {
            dir,
            chunk_threshold,
            timeout,
        }
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{:03}.ldb", index))
    }

    /// Chunk indexes present on disk, numerically sorted
    fn list_chunks(dir: &Path) -> Result<Vec<u32>> {
        let mut indexes = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".ldb") {
                if let Ok(index) = stem.parse::<u32>() {
                    indexes.push(index);
                }
            }
        }
        indexes.sort_unstable();
        Ok(indexes)
    }

    fn read_chunk(dir: &Path, index: u32) -> Result<Vec<Record>> {
        let path = Self::chunk_path(dir, index);
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::new(
                ErrorCode::FileContentInvalid,
                format!("chunk '{}' is not a JSON record array", path.display()),
            )
            .with_cause(e)
        })
    }

    fn write_chunk(dir: &Path, index: u32, records: &[Record]) -> Result<()> {
        let bytes = serde_json::to_vec(records)?;
        io_util::atomic_write(&Self::chunk_path(dir, index), &bytes)
    }

    /// Concatenate all chunks in numeric order. `None` when the directory
    /// does not exist.
    pub fn read_all(&self) -> Result<Option<Vec<Record>>> {
        let dir = self.dir.clone();
        with_timeout("chunked read", self.timeout, move || {
            if !dir.exists() {
                return Ok(None);
            }
            let mut all = Vec::new();
            for index in Self::list_chunks(&dir)? {
                all.extend(Self::read_chunk(&dir, index)?);
            }
            Ok(Some(all))
        })
    }

    /// Partial load of the inclusive chunk interval `[first, last]`.
    /// Chunks outside what exists on disk are skipped.
    pub fn read_range(&self, first: u32, last: u32) -> Result<Vec<Record>> {
        let dir = self.dir.clone();
        with_timeout("chunked range read", self.timeout, move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for index in Self::list_chunks(&dir)? {
                if index >= first && index <= last {
                    out.extend(Self::read_chunk(&dir, index)?);
                }
            }
            Ok(out)
        })
    }

    /// Append records to the tail, rolling to new chunks past the
    /// threshold. Returns the resulting chunk count.
    pub fn append(&self, records: Vec<Record>) -> Result<u32> {
        let dir = self.dir.clone();
        let threshold = self.chunk_threshold;
        with_timeout("chunked append", self.timeout, move || {
            std::fs::create_dir_all(&dir)?;
            let existing = Self::list_chunks(&dir)?;

            // Merge the tail chunk with the new records and re-split from
            // the tail index; earlier chunks stay untouched.
            let (tail_index, mut combined) = match existing.last() {
                Some(&tail) => (tail, Self::read_chunk(&dir, tail)?),
                None => (0, Vec::new()),
            };
            combined.extend(records);

            let parts = split_by_size(combined, threshold);
            for (offset, part) in parts.iter().enumerate() {
                Self::write_chunk(&dir, tail_index + offset as u32, part)?;
            }

            let count = tail_index + parts.len().max(1) as u32;
            Ok(count)
        })
    }

    /// Replace the whole table: clear the directory and rewrite as one or
    /// more chunks. Returns the chunk count.
    pub fn write(&self, records: Vec<Record>) -> Result<u32> {
        let dir = self.dir.clone();
        let threshold = self.chunk_threshold;
        with_timeout("chunked write", self.timeout, move || {
            std::fs::create_dir_all(&dir)?;
            Self::remove_chunks(&dir)?;
            let parts = split_by_size(records, threshold);
            for (index, part) in parts.iter().enumerate() {
                Self::write_chunk(&dir, index as u32, part)?;
            }
            Ok(parts.len() as u32)
        })
    }

    fn remove_chunks(dir: &Path) -> Result<()> {
        for index in Self::list_chunks(dir)? {
            std::fs::remove_file(Self::chunk_path(dir, index))?;
        }
        Ok(())
    }

    /// Remove every chunk file, keeping the directory
    pub fn clear(&self) -> Result<()> {
        let dir = self.dir.clone();
        with_timeout("chunked clear", self.timeout, move || {
            if dir.exists() {
                Self::remove_chunks(&dir)?;
            }
            Ok(())
        })
    }

    /// Remove all chunks and the directory itself
    pub fn delete(&self) -> Result<()> {
        let dir = self.dir.clone();
        with_timeout("chunked delete", self.timeout, move || {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Current chunk count on disk
    pub fn chunk_count(&self) -> Result<u32> {
        if !self.dir.exists() {
            return Ok(0);
        }
        Ok(Self::list_chunks(&self.dir)?.len() as u32)
    }
}

/// Greedy split of a record sequence into chunks of at most `threshold`
/// serialized bytes. A record larger than the threshold gets a chunk of
/// its own. Empty input yields one empty chunk so the table directory
/// still round-trips to `[]`.
fn split_by_size(records: Vec<Record>, threshold: usize) -> Vec<Vec<Record>> {
    if records.is_empty() {
        return vec![Vec::new()];
    }

    let mut parts: Vec<Vec<Record>> = Vec::new();
    let mut current: Vec<Record> = Vec::new();
    let mut current_size = 2; // brackets

    for record in records {
        let record_size =
            crate::types::estimate_size(&serde_json::Value::Object(record.clone())) + 1;
        if !current.is_empty() && current_size + record_size > threshold {
            parts.push(std::mem::take(&mut current));
            current_size = 2;
        }
        current_size += record_size;
        current.push(record);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
