//! Error types for litestore
//!
//! Defines a single error type carried through every component. Each error
//! has a stable machine-readable code, a human message, an optional cause
//! chain, and optional details/suggestion for callers that surface errors
//! to users.

use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Input
    TableNameInvalid,
    FileContentInvalid,
    TableColumnInvalid,
    QueryFailed,
    // State
    TableNotFound,
    TransactionInProgress,
    NoTransactionInProgress,
    DataIncomplete,
    // I/O
    FileReadFailed,
    FileWriteFailed,
    PermissionDenied,
    DiskFull,
    Timeout,
    // Crypto
    EncryptFailed,
    DecryptFailed,
    KeyDeriveFailed,
    HmacMismatch,
    // Operations
    TableCreateFailed,
    TableDeleteFailed,
    TableUpdateFailed,
    BulkOperationFailed,
    MigrationFailed,
    RateLimitExceeded,
}

impl ErrorCode {
    /// The wire-stable name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TableNameInvalid => "TABLE_NAME_INVALID",
            ErrorCode::FileContentInvalid => "FILE_CONTENT_INVALID",
            ErrorCode::TableColumnInvalid => "TABLE_COLUMN_INVALID",
            ErrorCode::QueryFailed => "QUERY_FAILED",
            ErrorCode::TableNotFound => "TABLE_NOT_FOUND",
            ErrorCode::TransactionInProgress => "TRANSACTION_IN_PROGRESS",
            ErrorCode::NoTransactionInProgress => "NO_TRANSACTION_IN_PROGRESS",
            ErrorCode::DataIncomplete => "DATA_INCOMPLETE",
            ErrorCode::FileReadFailed => "FILE_READ_FAILED",
            ErrorCode::FileWriteFailed => "FILE_WRITE_FAILED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::EncryptFailed => "ENCRYPT_FAILED",
            ErrorCode::DecryptFailed => "DECRYPT_FAILED",
            ErrorCode::KeyDeriveFailed => "KEY_DERIVE_FAILED",
            ErrorCode::HmacMismatch => "HMAC_MISMATCH",
            ErrorCode::TableCreateFailed => "TABLE_CREATE_FAILED",
            ErrorCode::TableDeleteFailed => "TABLE_DELETE_FAILED",
            ErrorCode::TableUpdateFailed => "TABLE_UPDATE_FAILED",
            ErrorCode::BulkOperationFailed => "BULK_OPERATION_FAILED",
            ErrorCode::MigrationFailed => "MIGRATION_FAILED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for store operations
#[derive(Debug)]
pub struct StoreError {
    /// Machine-readable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Underlying cause, if any
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Extra context (table name, key, chunk index, ...)
    pub details: Option<String>,
    /// Hint for the caller on how to recover
    pub suggestion: Option<String>,
    /// Unix millis at which the error was created
    pub timestamp: u64,
}

fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

impl StoreError {
    /// Create an error with just a code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            details: None,
            suggestion: None,
            timestamp: now_millis(),
        }
    }

    /// Attach an underlying cause
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach extra context
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach a recovery hint
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// "Table 'x' not found" with the standard suggestion
    pub fn table_not_found(table: &str) -> Self {
        Self::new(
            ErrorCode::TableNotFound,
            format!("Table '{}' not found", table),
        )
        .with_suggestion("Create the table first or check the table name")
    }

    /// Invalid table name (empty, whitespace, path characters)
    pub fn table_name_invalid(name: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::TableNameInvalid,
            format!("Invalid table name '{}': {}", name, reason),
        )
    }

    /// A timed-out I/O or crypto operation
    pub fn timeout(what: &str, millis: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("{} timed out after {}ms", what, millis),
        )
    }

    /// Whether the error looks retriable (used by the auto-sync retry loop)
    pub fn is_transient(&self) -> bool {
        if self.code == ErrorCode::Timeout {
            return true;
        }
        let msg = self.message.to_lowercase();
        ["timeout", "network", "connection", "busy", "locked", "unavailable"]
            .iter()
            .any(|needle| msg.contains(needle))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileReadFailed,
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ if e.raw_os_error() == Some(28) => ErrorCode::DiskFull, // ENOSPC
            _ => ErrorCode::FileWriteFailed,
        };
        StoreError::new(code, e.to_string()).with_cause(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::new(ErrorCode::FileContentInvalid, e.to_string()).with_cause(e)
    }
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
