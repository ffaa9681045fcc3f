//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read extended past the end of the stored bytes.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A file that must not exist yet was already present.
    #[error("file already exists: {}", path.display())]
    AlreadyExists {
        /// The conflicting path.
        path: PathBuf,
    },

    /// A file that must exist was missing.
    #[error("file not found: {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// An injected fault fired (crash simulation only).
    #[error("injected fault after {written} bytes")]
    InjectedFault {
        /// Bytes accepted before the fault.
        written: u64,
    },
}

impl StorageError {
    /// Returns true if this error came from fault injection.
    #[must_use]
    pub fn is_injected(&self) -> bool {
        matches!(self, Self::InjectedFault { .. })
    }
}
