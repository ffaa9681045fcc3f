//! In-memory storage backend with torn-write injection.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory byte store.
///
/// Clones share the same buffer, which lets a test keep a handle on bytes
/// that a component under test owns through a `Box<dyn StorageBackend>`.
///
/// A byte budget can be set with [`fail_after`](Self::fail_after): once the
/// budget is exhausted an append writes only the bytes that still fit and
/// returns [`StorageError::InjectedFault`], leaving a torn tail exactly as a
/// crash in the middle of a write would.
///
/// # Example
///
/// ```rust
/// use tablet_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.fail_after(3);
/// assert!(backend.append(b"record").is_err());
/// assert_eq!(backend.data(), b"rec");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    budget: Option<u64>,
    syncs: u64,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let backend = Self::default();
        backend.state.write().data = data;
        backend
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }

    /// Allows only `bytes` more bytes to be appended before faulting.
    pub fn fail_after(&self, bytes: u64) {
        self.state.write().budget = Some(bytes);
    }

    /// Removes any fault budget.
    pub fn heal(&self) {
        self.state.write().budget = None;
    }

    /// Returns how many times `sync` has been called.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.state.read().syncs
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.read();
        let size = state.data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if offset > size || end > state.data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(state.data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write();
        let offset = state.data.len() as u64;
        match state.budget {
            Some(budget) if (new_data.len() as u64) > budget => {
                let accepted = budget as usize;
                state.data.extend_from_slice(&new_data[..accepted]);
                state.budget = Some(0);
                Err(StorageError::InjectedFault {
                    written: offset + budget,
                })
            }
            Some(budget) => {
                state.budget = Some(budget - new_data.len() as u64);
                state.data.extend_from_slice(new_data);
                Ok(offset)
            }
            None => {
                state.data.extend_from_slice(new_data);
                Ok(offset)
            }
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.write().syncs += 1;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        let size = state.data.len() as u64;
        if new_size > size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {new_size} bytes, store holds {size}"),
            )));
        }
        state.data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"base").unwrap(), 0);
        assert_eq!(backend.append(b"undo").unwrap(), 4);
        assert_eq!(backend.size().unwrap(), 8);
    }

    #[test]
    fn clones_share_bytes() {
        let observer = InMemoryBackend::new();
        let mut writer: Box<dyn StorageBackend> = Box::new(observer.clone());
        writer.append(b"shared").unwrap();
        assert_eq!(observer.data(), b"shared");
    }

    #[test]
    fn fault_leaves_torn_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"whole").unwrap();
        backend.fail_after(2);

        let err = backend.append(b"partial").unwrap_err();
        assert!(err.is_injected());
        assert_eq!(backend.data(), b"wholepa");

        backend.heal();
        backend.append(b"!").unwrap();
        assert_eq!(backend.data(), b"wholepa!");
    }

    #[test]
    fn read_past_end_fails() {
        let backend = InMemoryBackend::with_data(b"abc".to_vec());
        assert!(matches!(
            backend.read_at(1, 3),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(3, 0).unwrap().is_empty());
    }

    #[test]
    fn sync_is_counted() {
        let mut backend = InMemoryBackend::new();
        backend.sync().unwrap();
        backend.sync().unwrap();
        assert_eq!(backend.sync_count(), 2);
    }

    #[test]
    fn truncate_cannot_grow() {
        let mut backend = InMemoryBackend::with_data(b"hello".to_vec());
        backend.truncate(2).unwrap();
        assert_eq!(backend.data(), b"he");
        assert!(backend.truncate(10).is_err());
    }

    proptest! {
        #[test]
        fn appended_chunks_concatenate(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
        ) {
            let mut backend = InMemoryBackend::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = backend.append(chunk).unwrap();
                prop_assert_eq!(offset, expected.len() as u64);
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(backend.read_all().unwrap(), expected);
        }
    }
}
