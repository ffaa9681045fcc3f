//! Flushes.
//!
//! A mutable store flush turns the active store into a new disk row set;
//! a delta flush turns the largest DMS into a REDO delta file. Both run in
//! three phases:
//!
//! 1. under the writer lock, freeze the in-memory store and route new
//!    writes to a fresh one;
//! 2. without the writer lock, write and sync the new files;
//! 3. under the writer lock, commit the manifest, install the new
//!    component set and rewrite the WAL.
//!
//! ## Invariants
//!
//! - readers see either the frozen store or the installed files, never
//!   both and never neither
//! - a failure after phase 1 poisons the tablet; the frozen contents are
//!   still in the WAL, so a restart loses nothing

use crate::delta::{DeltaDirection, DeltaMemStore, DeltaRecord, DeltaStore};
use crate::diskrowset::{BaseData, BaseRow, DiskRowSet};
use crate::error::{TabletError, TabletResult};
use crate::manifest::FlushedMrs;
use crate::memrowset::MemRowSet;
use crate::row::RowChange;
use crate::rowset::{sort_rowsets, Components, RowSet};
use crate::tablet::{TabletShared, WriterState};
use crate::types::{DmsId, FileId, RowSetId, Timestamp};
use std::cmp::Reverse;
use std::sync::Arc;

/// Ids reserved in phase 1 for the files of a flushed store.
#[derive(Debug, Clone, Copy)]
struct FlushFiles {
    rowset: RowSetId,
    base: FileId,
    undo: FileId,
    redo: FileId,
}

impl TabletShared {
    pub(crate) fn flush(&self) -> TabletResult<Option<RowSetId>> {
        let _maintenance = self.maintenance_lock.lock();
        self.check_poisoned()?;

        let (frozen, flush_ts, files) = {
            let mut writer = self.writer.lock();
            let current = self.current();
            if current.mrs.is_empty() {
                return Ok(None);
            }
            let frozen = Arc::clone(&current.mrs);
            let mut rowsets = current.rowsets.clone();
            rowsets.push(RowSet::Memory(Arc::clone(&frozen)));
            sort_rowsets(&mut rowsets);
            self.install(Components::new(
                Arc::new(MemRowSet::new(frozen.id().next())),
                rowsets,
            ));
            let manifest = &mut writer.manifest;
            let files = FlushFiles {
                rowset: manifest.allocate_rowset_id(),
                base: manifest.allocate_file_id(),
                undo: manifest.allocate_file_id(),
                redo: manifest.allocate_file_id(),
            };
            (frozen, self.clock.now(), files)
        };

        let drs = match self.write_flushed_store(&frozen, flush_ts, files) {
            Ok(drs) => Arc::new(drs),
            Err(err) => {
                self.discard_rowset(files.rowset);
                return Err(self.poison(err));
            }
        };

        let mut writer = self.writer.lock();
        self.install_flushed_store(&mut writer, &frozen, flush_ts, Arc::clone(&drs))
            .map_err(|err| self.poison(err))?;
        self.metrics.record_flush();
        tracing::info!(
            mrs = %frozen.id(),
            rowset = %drs.id(),
            rows = drs.base().len(),
            flush_ts = %flush_ts,
            "flushed mutable store"
        );
        Ok(Some(drs.id()))
    }

    /// Writes the frozen store as of `flush_ts`: inserted values form the
    /// base image, each insert gets an UNDO delete, and the change list
    /// becomes REDO records at the original timestamps.
    fn write_flushed_store(
        &self,
        frozen: &MemRowSet,
        flush_ts: Timestamp,
        files: FlushFiles,
    ) -> TabletResult<DiskRowSet> {
        let rows = frozen.snapshot();
        let mut base = Vec::with_capacity(rows.len());
        let mut undo = Vec::with_capacity(rows.len());
        let mut redo = Vec::new();
        for (key, row) in rows {
            undo.push(DeltaRecord::new(key.clone(), row.insert_ts, RowChange::Delete));
            for (ts, change) in row.changes {
                if ts <= flush_ts {
                    redo.push(DeltaRecord::new(key.clone(), ts, change));
                }
            }
            base.push(BaseRow {
                key,
                values: Some(row.values),
            });
        }

        self.dir.create_rowset_dir(files.rowset)?;
        let base = BaseData::new(files.base, base)?;
        base.write_to(&self.dir.base_path(files.rowset, files.base))?;
        let undo = self.write_delta_store(files.rowset, files.undo, DeltaDirection::Undo, undo)?;
        let mut redos = Vec::new();
        if !redo.is_empty() {
            let store =
                self.write_delta_store(files.rowset, files.redo, DeltaDirection::Redo, redo)?;
            redos.push(Arc::new(store));
        }
        self.dir.sync_rowset_dir(files.rowset)?;

        DiskRowSet::new(
            files.rowset,
            flush_ts,
            Arc::new(base),
            Arc::new(undo),
            redos,
            Arc::new(DeltaMemStore::new(DmsId(0))),
        )
    }

    fn install_flushed_store(
        &self,
        writer: &mut WriterState,
        frozen: &Arc<MemRowSet>,
        flush_ts: Timestamp,
        drs: Arc<DiskRowSet>,
    ) -> TabletResult<()> {
        // Changes that reached frozen rows while the files were written.
        let dms = drs.dms();
        for (key, ts, change) in frozen.changes_after(flush_ts) {
            dms.append(key, ts, change);
        }

        let mut manifest = writer.manifest.clone();
        manifest.apply_rowset_edit(&[], vec![drs.meta()?]);
        manifest.next_mrs_id = frozen.id().next();
        manifest.last_flush = Some(FlushedMrs {
            mrs_id: frozen.id(),
            flush_ts,
            rowset: drs.id(),
        });
        self.commit_manifest(writer, manifest)?;

        let current = self.current();
        let mut rowsets: Vec<RowSet> = current
            .rowsets
            .iter()
            .filter(|set| !matches!(set, RowSet::Memory(mrs) if Arc::ptr_eq(mrs, frozen)))
            .cloned()
            .collect();
        rowsets.push(RowSet::Disk(drs));
        sort_rowsets(&mut rowsets);
        self.install(Components::new(Arc::clone(&current.mrs), rowsets));

        self.rewrite_wal(writer)
    }

    pub(crate) fn flush_deltas(&self) -> TabletResult<Option<RowSetId>> {
        let _maintenance = self.maintenance_lock.lock();
        self.check_poisoned()?;

        let (id, frozen_dms, file) = {
            let mut writer = self.writer.lock();
            let current = self.current();
            let Some(target) = current
                .disk_rowsets()
                .filter(|drs| !drs.dms().is_empty())
                .max_by_key(|drs| (drs.dms().len(), Reverse(drs.id())))
            else {
                return Ok(None);
            };
            let frozen_dms = Arc::clone(target.dms());
            let next = Arc::new(target.with_frozen_dms()?);
            self.install(current.with_disk_rowsets(&[], vec![next]));
            (target.id(), frozen_dms, writer.manifest.allocate_file_id())
        };

        let store = self
            .write_delta_store(id, file, DeltaDirection::Redo, frozen_dms.to_records())
            .and_then(|store| {
                self.dir.sync_rowset_dir(id)?;
                Ok(store)
            })
            .map_err(|err| self.poison(err))?;
        let records = store.len();

        let mut writer = self.writer.lock();
        self.install_flushed_deltas(&mut writer, id, Arc::new(store))
            .map_err(|err| self.poison(err))?;
        self.metrics.record_delta_flush();
        tracing::info!(rowset = %id, dms = %frozen_dms.id(), records, "flushed delta memory store");
        Ok(Some(id))
    }

    fn install_flushed_deltas(
        &self,
        writer: &mut WriterState,
        id: RowSetId,
        store: Arc<DeltaStore>,
    ) -> TabletResult<()> {
        let current = self.current();
        let drs = current
            .disk_rowset(id)
            .ok_or_else(|| TabletError::corruption(format!("{id} vanished during a delta flush")))?;
        let flushed = Arc::new(drs.with_flushed_dms(store));

        let mut manifest = writer.manifest.clone();
        manifest.apply_rowset_edit(&[], vec![flushed.meta()?]);
        self.commit_manifest(writer, manifest)?;
        self.install(current.with_disk_rowsets(&[], vec![flushed]));
        self.rewrite_wal(writer)
    }

    /// Builds a delta store (checking its order) and writes it durably.
    pub(crate) fn write_delta_store(
        &self,
        rowset: RowSetId,
        file: FileId,
        direction: DeltaDirection,
        records: Vec<DeltaRecord>,
    ) -> TabletResult<DeltaStore> {
        let store = DeltaStore::new(file, direction, records)?;
        store.write_to(&self.dir.delta_path(rowset, file, direction))?;
        Ok(store)
    }

    /// Best-effort removal of a row set directory that was never committed.
    /// Anything left over is deleted as an orphan on the next open.
    pub(crate) fn discard_rowset(&self, id: RowSetId) {
        if let Err(err) = self.dir.remove_rowsets(&[id]) {
            tracing::warn!(rowset = %id, error = %err, "could not remove uncommitted row set");
        }
    }
}
