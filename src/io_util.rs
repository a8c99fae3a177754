//! Blocking I/O helpers
//!
//! Every file operation in the store goes through [`with_timeout`], which
//! runs the operation on a scratch thread and converts an overrun into a
//! `TIMEOUT` error. The worker keeps running to completion in the
//! background, so an abandoned write still finishes or fails on its own;
//! only the caller stops waiting.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Default per-operation I/O timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a blocking operation with a timeout. The closure executes on its own
/// thread; if it does not produce a result within `timeout` the caller gets
/// `ErrorCode::Timeout` and the thread is left to finish detached.
pub fn with_timeout<T, F>(what: &str, timeout: Duration, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        // The receiver may be gone after a timeout; nothing to do then.
        let _ = tx.send(op());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(StoreError::timeout(what, timeout.as_millis() as u64))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(StoreError::timeout(
            what,
            timeout.as_millis() as u64,
        )
        .with_details("worker thread exited without a result")),
    }
}

/// Atomically replace `path` with `bytes`: write to a temp file in the same
/// directory, flush, then rename over the target. Readers observe either
/// the old or the new content, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::new(
            crate::error::ErrorCode::FileWriteFailed,
            format!("path '{}' has no parent directory", path.display()),
        )
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| StoreError::from(e.error))?;
    Ok(())
}

/// Read a file fully, mapping a missing file to `Ok(None)`
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::tempdir;

    #[test]
    fn test_with_timeout_returns_result() {
        let out = with_timeout("fast op", Duration::from_secs(1), || Ok(21 * 2)).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_with_timeout_propagates_errors() {
        let err = with_timeout::<(), _>("failing op", Duration::from_secs(1), || {
            Err(StoreError::new(ErrorCode::FileReadFailed, "boom"))
        })
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileReadFailed);
    }

    #[test]
    fn test_with_timeout_times_out() {
        let err = with_timeout("slow op", Duration::from_millis(20), || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.message.contains("slow op"));
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.ldb");

        atomic_write(&path, b"[1]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[1]");

        atomic_write(&path, b"[1,2]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[1,2]");
    }

    #[test]
    fn test_read_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.ldb");
        assert!(read_if_exists(&path).unwrap().is_none());

        fs::write(&path, b"x").unwrap();
        assert_eq!(read_if_exists(&path).unwrap(), Some(b"x".to_vec()));
    }
}
