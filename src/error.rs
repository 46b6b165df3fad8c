//! Error types for serialdb operations.

use thiserror::Error;

/// Result type alias using [`SerialDbError`].
pub type Result<T> = std::result::Result<T, SerialDbError>;

/// Error types for serialdb operations.
#[derive(Debug, Error)]
pub enum SerialDbError {
    // ==================== Storage Errors ====================
    /// General storage/I/O error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Page-related errors (bad layout, page full, inventory exhausted).
    #[error("Page error: {0}")]
    PageError(String),

    /// Checksum validation failure.
    #[error("Checksum mismatch: {0}")]
    ChecksumError(String),

    /// Database file corruption detected.
    #[error("Corrupted database: {0}")]
    CorruptedDatabase(String),

    /// Invalid database magic bytes or missing files.
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// Unsupported table space or log format version.
    #[error("Unsupported database version: {version} (max supported: {max_supported})")]
    UnsupportedVersion { version: u32, max_supported: u32 },

    /// Section lookup or placement failure.
    #[error("Section error: {0}")]
    SectionError(String),

    /// No table space registered under the given id.
    #[error("Table space {0} not found")]
    TableSpaceNotFound(u32),

    // ==================== Serial Log Errors ====================
    /// Malformed serial log content.
    #[error("Serial log error: {0}")]
    LogError(String),

    /// A record continued past the last readable block.
    #[error("Serial log overrun after block {block_number}")]
    LogOverrun { block_number: u64 },

    /// A length field asked for more data than the log can hold.
    #[error("Data overrun in serial log at block {block_number}: requested {requested} bytes")]
    DataOverrun { block_number: u64, requested: i64 },

    /// Recovery could not replay the log.
    #[error("Recovery failed at block {block_number}: {message}")]
    Recovery { block_number: u64, message: String },

    /// An earlier log write failed; nothing further can be made durable.
    #[error("Serial log is unusable after a previous write failure")]
    LogWriteFailed,

    // ==================== Transaction Errors ====================
    /// Transaction misuse (wrong state, unknown XID).
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// The log has no record of the given transaction.
    #[error("Unknown transaction {0}")]
    UnknownTransaction(u32),

    /// The gopher could not apply a transaction's logged changes.
    #[error("Transaction {transaction_id} could not be completed: {message}")]
    CompletionFailed { transaction_id: u32, message: String },

    /// An internal invariant did not hold.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A background worker thread panicked.
    #[error("Worker thread panicked: {0}")]
    ThreadPanic(String),
}

impl SerialDbError {
    /// Wraps this error as a recovery failure at the given block.
    #[must_use]
    pub fn during_recovery(self, block_number: u64) -> Self {
        match self {
            err @ SerialDbError::Recovery { .. } => err,
            other => SerialDbError::Recovery {
                block_number,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_wrapping_keeps_first_block() {
        let err = SerialDbError::LogOverrun { block_number: 9 }.during_recovery(9);
        let err = err.during_recovery(12);
        match err {
            SerialDbError::Recovery {
                block_number,
                message,
            } => {
                assert_eq!(block_number, 9);
                assert!(message.contains("overrun"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
