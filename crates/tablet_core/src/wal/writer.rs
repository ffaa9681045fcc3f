//! WAL writer.

use crate::error::TabletResult;
use crate::wal::iterator::WalIterator;
use crate::wal::record::WalBatch;
use std::path::{Path, PathBuf};
use tablet_storage::{replace_file_atomically, FileBackend, StorageBackend};

/// Appends batches to the log and rewrites it after maintenance.
///
/// The writer is owned by the tablet's writer state, so appends are
/// serialized by the tablet writer lock rather than by a lock of its own.
pub struct WalWriter {
    backend: Box<dyn StorageBackend>,
    path: Option<PathBuf>,
    sync_on_commit: bool,
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("path", &self.path)
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

impl WalWriter {
    /// Opens (or creates) the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, sync_on_commit: bool) -> TabletResult<Self> {
        Ok(Self {
            backend: Box::new(FileBackend::open(path)?),
            path: Some(path.to_path_buf()),
            sync_on_commit,
        })
    }

    /// Wraps an arbitrary backend. Rewrites then truncate in place instead
    /// of replacing a file.
    #[must_use]
    pub fn with_backend(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            path: None,
            sync_on_commit,
        }
    }

    /// Appends a batch and, if configured, syncs it.
    ///
    /// Returns the offset the record was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the write or the sync fails. The
    /// batch must then not be acknowledged.
    pub fn append(&mut self, batch: &WalBatch) -> TabletResult<u64> {
        let data = batch.encode()?;
        let offset = self.backend.append(&data)?;
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Makes every appended batch durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> TabletResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> TabletResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Returns a streaming iterator over the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> TabletResult<WalIterator<'_>> {
        WalIterator::new(self.backend.as_ref(), 0)
    }

    /// Replaces the log with the batches `keep` returns.
    ///
    /// Every record is read back; `keep` may drop a batch (`None`) or
    /// return an edited one. A file-backed log is replaced atomically, so a
    /// crash leaves either the old or the new log. Returns the number of
    /// batches retained.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read, `keep` fails or the new
    /// log cannot be made durable. The old log is then left untouched.
    pub fn rewrite<F>(&mut self, mut keep: F) -> TabletResult<usize>
    where
        F: FnMut(WalBatch) -> TabletResult<Option<WalBatch>>,
    {
        let mut data = Vec::new();
        let mut retained = 0;
        for item in self.iter()? {
            let (_, batch) = item?;
            if let Some(batch) = keep(batch)? {
                data.extend_from_slice(&batch.encode()?);
                retained += 1;
            }
        }

        match &self.path {
            Some(path) => {
                replace_file_atomically(path, &data)?;
                self.backend = Box::new(FileBackend::open(path)?);
            }
            None => {
                self.backend.truncate(0)?;
                self.backend.append(&data)?;
                self.backend.sync()?;
            }
        }
        Ok(retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RowKey, RowOp};
    use crate::types::{MrsId, Timestamp};
    use crate::wal::record::{LoggedOp, OpTarget};
    use tablet_storage::InMemoryBackend;
    use tempfile::tempdir;

    fn batch(ts: u64) -> WalBatch {
        WalBatch {
            ts: Timestamp(ts),
            ops: vec![LoggedOp {
                op: RowOp::Delete(RowKey::int(ts as i64)),
                target: OpTarget::Mrs(MrsId(1)),
            }],
        }
    }

    fn timestamps(wal: &WalWriter) -> Vec<u64> {
        wal.iter()
            .unwrap()
            .map(|r| r.unwrap().1.ts.as_u64())
            .collect()
    }

    #[test]
    fn append_syncs_when_configured() {
        let backend = InMemoryBackend::new();
        let mut wal = WalWriter::with_backend(Box::new(backend.clone()), true);
        wal.append(&batch(1)).unwrap();
        wal.append(&batch(2)).unwrap();
        assert_eq!(backend.sync_count(), 2);
        assert_eq!(timestamps(&wal), vec![1, 2]);
    }

    #[test]
    fn rewrite_filters_in_memory() {
        let mut wal = WalWriter::with_backend(Box::new(InMemoryBackend::new()), false);
        for ts in 1..=5 {
            wal.append(&batch(ts)).unwrap();
        }
        let kept = wal
            .rewrite(|b| Ok((b.ts.as_u64() % 2 == 0).then_some(b)))
            .unwrap();
        assert_eq!(kept, 2);
        assert_eq!(timestamps(&wal), vec![2, 4]);
    }

    #[test]
    fn rewrite_replaces_file_and_keeps_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = WalWriter::open(&path, true).unwrap();
        for ts in 1..=3 {
            wal.append(&batch(ts)).unwrap();
        }
        wal.rewrite(|b| Ok((b.ts.as_u64() > 1).then_some(b)))
            .unwrap();
        wal.append(&batch(4)).unwrap();
        drop(wal);

        let wal = WalWriter::open(&path, true).unwrap();
        assert_eq!(timestamps(&wal), vec![2, 3, 4]);
    }

    #[test]
    fn rewrite_drops_torn_tail() {
        let backend = InMemoryBackend::new();
        let mut wal = WalWriter::with_backend(Box::new(backend.clone()), false);
        wal.append(&batch(1)).unwrap();
        backend.fail_after(5);
        assert!(wal.append(&batch(2)).is_err());
        backend.heal();

        wal.rewrite(|b| Ok(Some(b))).unwrap();
        wal.append(&batch(3)).unwrap();
        assert_eq!(timestamps(&wal), vec![1, 3]);
    }
}
