//! Error types for the tablet engine.
//!
//! Errors fall in two classes:
//!
//! - **Per-call** errors (`Validation`, `KeyExists`, `KeyNotFound`,
//!   `SnapshotTooOld`, `InvalidOperation`) reject one operation and leave
//!   the tablet usable.
//! - **Fatal** errors (`OrderingViolation`, `Corruption`, checksum failures
//!   and failed durable writes) poison the tablet until it is restarted.

use std::io;
use thiserror::Error;

use crate::row::RowKey;
use crate::types::Timestamp;

/// Result type for tablet operations.
pub type TabletResult<T> = Result<T, TabletError>;

/// Errors that can occur in tablet operations.
#[derive(Debug, Error)]
pub enum TabletError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tablet_storage::StorageError),

    /// I/O error outside a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record body could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// An operation was malformed (bad key arity, unknown column, ...).
    #[error("validation error: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// INSERT of a key that already has a live version.
    #[error("key already present: {key}")]
    KeyExists {
        /// The conflicting key.
        key: RowKey,
    },

    /// UPDATE or DELETE of a key with no live version.
    #[error("key not found: {key}")]
    KeyNotFound {
        /// The missing key.
        key: RowKey,
    },

    /// A delta sequence broke the key/timestamp ordering rule.
    #[error("delta ordering violation: {message}")]
    OrderingViolation {
        /// Where and how the order was broken.
        message: String,
    },

    /// Persisted or in-memory state is inconsistent.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The write-ahead log is damaged.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A read asked for history that has been garbage collected.
    #[error("snapshot {requested} is older than the ancient history mark {mark}")]
    SnapshotTooOld {
        /// The requested snapshot.
        requested: Timestamp,
        /// The oldest readable timestamp.
        mark: Timestamp,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is not permitted.
        message: String,
    },

    /// Another process holds the tablet directory lock.
    #[error("tablet locked: another process has exclusive access")]
    TabletLocked,

    /// A previous fatal error left the tablet unusable until restart.
    #[error("tablet poisoned by an earlier fatal error; restart to recover")]
    TabletPoisoned,
}

impl TabletError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an ordering violation.
    pub fn ordering(message: impl Into<String>) -> Self {
        Self::OrderingViolation {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error must poison the tablet.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::Codec { .. }
                | Self::OrderingViolation { .. }
                | Self::Corruption { .. }
                | Self::WalCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Returns true if this error means stored or in-memory data is wrong,
    /// as opposed to an environment failure such as a full disk.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::OrderingViolation { .. }
                | Self::Corruption { .. }
                | Self::WalCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Returns true if this error rejected a single row operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::KeyExists { .. } | Self::KeyNotFound { .. }
        )
    }
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for TabletError {
    fn from(err: ciborium::ser::Error<T>) -> Self {
        Self::codec(format!("encode: {err:?}"))
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for TabletError {
    fn from(err: ciborium::de::Error<T>) -> Self {
        Self::codec(format!("decode: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    #[test]
    fn classification() {
        assert!(TabletError::ordering("x").is_fatal());
        assert!(TabletError::corruption("x").is_fatal());
        assert!(!TabletError::validation("x").is_fatal());
        assert!(TabletError::ordering("x").is_corruption());
        let io = TabletError::Io(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(io.is_fatal());
        assert!(!io.is_corruption());

        let missing = TabletError::KeyNotFound {
            key: RowKey::single(Value::Int(4)),
        };
        assert!(missing.is_rejection());
        assert!(!missing.is_fatal());
        assert_eq!(missing.to_string(), "key not found: (4)");
    }
}
