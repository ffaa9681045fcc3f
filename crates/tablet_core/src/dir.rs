//! Tablet directory management.
//!
//! ```text
//! <tablet_path>/
//! ├─ LOCK                     # Advisory lock for the single owning process
//! ├─ MANIFEST                 # Row-set collection, schema, id counters
//! ├─ wal.log                  # Write-ahead log
//! └─ rowsets/
//!    └─ rs-000001/
//!       ├─ base-000001.dat    # Base image
//!       ├─ undo-000002.dlt    # UNDO deltas
//!       └─ redo-000005.dlt    # REDO deltas (zero or more)
//! ```
//!
//! Files not named by the manifest are leftovers of an interrupted flush
//! or compaction and are removed on open.

use crate::delta::DeltaDirection;
use crate::error::{TabletError, TabletResult};
use crate::manifest::Manifest;
use crate::types::{FileId, RowSetId};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tablet_storage::{replace_file_atomically, FileBackend, StorageBackend};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const ROWSETS_DIR: &str = "rowsets";

/// Owns a tablet directory and its exclusive lock.
///
/// Only one `TabletDir` per directory can exist at a time, across
/// processes; the lock is released when the value is dropped.
#[derive(Debug)]
pub struct TabletDir {
    path: PathBuf,
    _lock_file: File,
}

impl TabletDir {
    /// Opens a tablet directory, creating it if allowed.
    ///
    /// # Errors
    ///
    /// Returns `TabletLocked` if another owner holds the lock, and a
    /// validation error if the directory is missing and may not be created
    /// or the path is not a directory.
    pub fn open(path: &Path, create_if_missing: bool) -> TabletResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(TabletError::validation(format!(
                    "tablet directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(TabletError::validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(TabletError::TabletLocked);
        }
        fs::create_dir_all(path.join(ROWSETS_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the tablet directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Returns the directory holding one subdirectory per row set.
    #[must_use]
    pub fn rowsets_dir(&self) -> PathBuf {
        self.path.join(ROWSETS_DIR)
    }

    /// Returns the directory of one row set.
    #[must_use]
    pub fn rowset_dir(&self, id: RowSetId) -> PathBuf {
        self.rowsets_dir().join(format!("rs-{:06}", id.as_u64()))
    }

    /// Returns the path of a base image file.
    #[must_use]
    pub fn base_path(&self, rowset: RowSetId, file: FileId) -> PathBuf {
        self.rowset_dir(rowset)
            .join(format!("base-{:06}.dat", file.as_u64()))
    }

    /// Returns the path of a delta file.
    #[must_use]
    pub fn delta_path(&self, rowset: RowSetId, file: FileId, direction: DeltaDirection) -> PathBuf {
        let prefix = match direction {
            DeltaDirection::Undo => "undo",
            DeltaDirection::Redo => "redo",
        };
        self.rowset_dir(rowset)
            .join(format!("{prefix}-{:06}.dlt", file.as_u64()))
    }

    /// Creates the directory of a new row set.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn create_rowset_dir(&self, id: RowSetId) -> TabletResult<PathBuf> {
        let dir = self.rowset_dir(id);
        fs::create_dir_all(&dir)?;
        sync_directory(&self.rowsets_dir())?;
        Ok(dir)
    }

    /// Makes the entries of a row set directory durable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be synced.
    pub fn sync_rowset_dir(&self, id: RowSetId) -> TabletResult<()> {
        sync_directory(&self.rowset_dir(id))
    }

    /// Returns true if neither a manifest nor a log exists yet.
    #[must_use]
    pub fn is_new_tablet(&self) -> bool {
        !self.manifest_path().exists() && !self.wal_path().exists()
    }

    /// Loads the manifest, or `None` for a new tablet.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be read or
    /// verified.
    pub fn load_manifest(&self) -> TabletResult<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = FileBackend::open_existing(&path)?.read_all()?;
        Manifest::decode(&data).map(Some)
    }

    /// Replaces the manifest atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the new manifest cannot be made durable; the old
    /// one is then still in place.
    pub fn save_manifest(&self, manifest: &Manifest) -> TabletResult<()> {
        let data = manifest.encode()?;
        replace_file_atomically(&self.manifest_path(), &data)?;
        Ok(())
    }

    /// Deletes the directories of row sets that were compacted away.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be removed.
    pub fn remove_rowsets(&self, ids: &[RowSetId]) -> TabletResult<usize> {
        let mut removed = 0;
        for id in ids {
            let dir = self.rowset_dir(*id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        if removed > 0 {
            sync_directory(&self.rowsets_dir())?;
        }
        Ok(removed)
    }

    /// Deletes single data files that are no longer referenced.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file cannot be removed.
    pub fn remove_files(&self, paths: &[PathBuf]) -> TabletResult<()> {
        for path in paths {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Removes row set directories and data files the manifest does not
    /// name, plus temporary files of interrupted atomic writes.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed or cleaned.
    pub fn remove_orphans(&self, manifest: &Manifest) -> TabletResult<usize> {
        let mut removed = 0;

        for name in ["MANIFEST.tmp", "wal.log.tmp"] {
            let path = self.path.join(name);
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        for entry in fs::read_dir(self.rowsets_dir())? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry
                .file_name()
                .to_str()
                .and_then(parse_rowset_dir)
                .and_then(|id| manifest.rowset(id));
            let Some(meta) = meta else {
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                removed += 1;
                continue;
            };

            let mut keep: BTreeSet<PathBuf> = BTreeSet::new();
            keep.insert(self.base_path(meta.id, meta.base_file));
            keep.insert(self.delta_path(meta.id, meta.undo_file, DeltaDirection::Undo));
            for file in &meta.redo_files {
                keep.insert(self.delta_path(meta.id, *file, DeltaDirection::Redo));
            }
            for file in fs::read_dir(&path)? {
                let file = file?.path();
                if !keep.contains(&file) {
                    fs::remove_file(&file)?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            sync_directory(&self.rowsets_dir())?;
            tracing::info!(removed, "removed orphaned tablet files");
        }
        Ok(removed)
    }
}

fn parse_rowset_dir(name: &str) -> Option<RowSetId> {
    name.strip_prefix("rs-")?.parse().ok().map(RowSetId)
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> TabletResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> TabletResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RowSetMeta;
    use crate::row::{RowKey, Schema};
    use crate::types::{DmsId, Timestamp};
    use tempfile::tempdir;

    fn manifest() -> Manifest {
        Manifest::new(Schema::new(["key"], ["val"]).unwrap())
    }

    #[test]
    fn open_creates_layout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("tablet");
        let dir = TabletDir::open(&path, true).unwrap();
        assert!(dir.rowsets_dir().is_dir());
        assert!(dir.is_new_tablet());
        assert!(dir.load_manifest().unwrap().is_none());
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        assert!(TabletDir::open(&temp.path().join("nope"), false).is_err());
    }

    #[test]
    fn lock_is_exclusive_until_drop() {
        let temp = tempdir().unwrap();
        let dir = TabletDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            TabletDir::open(temp.path(), true),
            Err(TabletError::TabletLocked)
        ));
        drop(dir);
        TabletDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn manifest_survives_reopen() {
        let temp = tempdir().unwrap();
        let mut m = manifest();
        m.allocate_rowset_id();
        {
            let dir = TabletDir::open(temp.path(), true).unwrap();
            dir.save_manifest(&m).unwrap();
        }
        let dir = TabletDir::open(temp.path(), false).unwrap();
        assert_eq!(dir.load_manifest().unwrap(), Some(m));
    }

    #[test]
    fn orphans_are_removed() {
        let temp = tempdir().unwrap();
        let dir = TabletDir::open(temp.path(), true).unwrap();
        let mut m = manifest();
        let live = m.allocate_rowset_id();
        let dead = m.allocate_rowset_id();
        m.apply_rowset_edit(
            &[],
            vec![RowSetMeta {
                id: live,
                created_ts: Timestamp(1),
                min_key: RowKey::int(1),
                max_key: RowKey::int(1),
                base_file: FileId(1),
                undo_file: FileId(2),
                redo_files: Vec::new(),
                durable_dms_below: DmsId(0),
            }],
        );

        dir.create_rowset_dir(live).unwrap();
        dir.create_rowset_dir(dead).unwrap();
        let base = dir.base_path(live, FileId(1));
        let stray = dir.delta_path(live, FileId(7), DeltaDirection::Redo);
        fs::write(&base, b"x").unwrap();
        fs::write(&stray, b"x").unwrap();
        fs::write(dir.path().join("MANIFEST.tmp"), b"x").unwrap();

        assert_eq!(dir.remove_orphans(&m).unwrap(), 3);
        assert!(base.exists());
        assert!(!stray.exists());
        assert!(!dir.rowset_dir(dead).exists());
    }

    #[test]
    fn file_names() {
        let temp = tempdir().unwrap();
        let dir = TabletDir::open(temp.path(), true).unwrap();
        let path = dir.delta_path(RowSetId(3), FileId(12), DeltaDirection::Undo);
        assert!(path.ends_with("rowsets/rs-000003/undo-000012.dlt"));
        assert_eq!(parse_rowset_dir("rs-000042"), Some(RowSetId(42)));
        assert_eq!(parse_rowset_dir("junk"), None);
    }
}
