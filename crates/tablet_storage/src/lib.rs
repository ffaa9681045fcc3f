//! # Tablet Storage
//!
//! Byte-store backends underneath the tablet engine.
//!
//! Every persistent artifact of a tablet (the write-ahead log, base-image
//! files, UNDO/REDO delta files and the manifest) is written through a
//! [`StorageBackend`]. Backends never interpret what they hold; framing,
//! checksums and ordering rules belong to `tablet_core`.
//!
//! ## Design Principles
//!
//! - Backends are append-only byte stores with positional reads
//! - Immutable data files are created once with [`FileBackend::create_new`]
//!   and never reopened for writing
//! - Small metadata files are swapped in with [`replace_file_atomically`]
//! - Backends must be `Send + Sync` so readers can share them
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - OS files, used for everything on disk
//! - [`InMemoryBackend`] - ephemeral storage with optional torn-write
//!   injection for crash tests
//!
//! ## Example
//!
//! ```rust
//! use tablet_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"TDLT").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"TDLT");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{replace_file_atomically, FileBackend};
pub use memory::InMemoryBackend;
