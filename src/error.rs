//! Error types for the replicated transactional logging engine.
//!
//! Defines a unified error type that can represent errors from every
//! component: record framing, the physical log, recovery, checkpointing,
//! copy/build, backups, and the version manager.

use std::fmt;
use std::io;

pub type TxnId = u64;

/// Unified error type for replicator operations.
#[derive(Debug)]
pub enum ReplicatorError {
    /// I/O error (file operations, logical log).
    Io(io::Error),
    /// A record or configuration argument was invalid.
    InvalidArgument(String),
    /// An `*Async` operation exceeded its deadline.
    Timeout(String),
    /// An `*Async` operation was cancelled via its token.
    Cancelled,
    /// The calling transaction has already been aborted.
    TransactionAborted(String),
    /// The calling transaction is not in the `Active` state.
    TransactionNotActive(TxnId),
    /// A transaction was accessed from more than one caller concurrently
    /// (e.g. a commit racing a read).
    MultithreadedTransaction(TxnId),
    /// The external replicator rejected a `ReplicateAndLog` call because no
    /// write quorum could be formed.
    NoWriteQuorum,
    /// A backup folder contains no full backup.
    MissingFullBackup,
    /// An operation was attempted in a state that forbids it (e.g. a second
    /// checkpoint while one is in flight).
    InvalidOperation(String),
    /// A parameter combination is individually well-formed but jointly
    /// invalid (e.g. a backup chain fork, an epoch regression).
    InvalidParameter(String),
    /// The component (log, replica) has already been closed.
    ObjectClosed,
    /// Backpressure: the caller must retry after resources free up.
    InsufficientResources(String),
    /// Unrecoverable error; the replica must report fault and close.
    Fatal(String),
    /// Record (de)serialization failed.
    Serialization(String),
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Io(e) => write!(f, "{}", e),
            ReplicatorError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ReplicatorError::Timeout(msg) => write!(f, "timeout: {}", msg),
            ReplicatorError::Cancelled => write!(f, "operation cancelled"),
            ReplicatorError::TransactionAborted(msg) => write!(f, "transaction aborted: {}", msg),
            ReplicatorError::TransactionNotActive(id) => {
                write!(f, "transaction {} is not active", id)
            }
            ReplicatorError::MultithreadedTransaction(id) => write!(
                f,
                "transaction {} was accessed concurrently from more than one caller",
                id
            ),
            ReplicatorError::NoWriteQuorum => write!(f, "no write quorum available"),
            ReplicatorError::MissingFullBackup => write!(f, "backup folder has no full backup"),
            ReplicatorError::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            ReplicatorError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            ReplicatorError::ObjectClosed => write!(f, "object has been closed"),
            ReplicatorError::InsufficientResources(msg) => {
                write!(f, "insufficient resources: {}", msg)
            }
            ReplicatorError::Fatal(msg) => write!(f, "fatal error: {}", msg),
            ReplicatorError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ReplicatorError {}

impl From<io::Error> for ReplicatorError {
    fn from(e: io::Error) -> Self {
        ReplicatorError::Io(e)
    }
}

impl From<bincode::Error> for ReplicatorError {
    fn from(e: bincode::Error) -> Self {
        ReplicatorError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(e: serde_json::Error) -> Self {
        ReplicatorError::Serialization(e.to_string())
    }
}

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_readable() {
        assert_eq!(
            ReplicatorError::TransactionNotActive(7).to_string(),
            "transaction 7 is not active"
        );
        assert_eq!(ReplicatorError::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: ReplicatorError = io_err.into();
        assert!(matches!(err, ReplicatorError::Io(_)));
    }
}
