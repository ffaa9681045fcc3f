//! Immutable row containers ("disk row sets").
//!
//! A disk row set is a base image plus history:
//!
//! ```text
//!   older  <-- UNDO store --  base image  -- REDO stores --> frozen DMS --> DMS  newer
//! ```
//!
//! Reading key `k` at `ts` starts from the base entry, applies UNDO records
//! newer than `ts` (walking back in time) and REDO records at or before
//! `ts` (walking forward).
//!
//! ## Invariants
//!
//! - base keys are strictly ascending and every key with history in this
//!   row set has a base entry; a *ghost* entry (no values) stands for a key
//!   that was absent at base time but still has UNDO history
//! - every UNDO timestamp of a key is `<=` every REDO timestamp of that key
//! - the struct is never mutated after construction except through the
//!   internally locked DMS; installing new delta stores builds a new
//!   `DiskRowSet` that shares the unchanged parts

use crate::codec::{read_data_file, write_data_file};
use crate::delta::{DeltaDirection, DeltaMemStore, DeltaRecord, DeltaStore};
use crate::dir::TabletDir;
use crate::error::{TabletError, TabletResult};
use crate::manifest::RowSetMeta;
use crate::row::{RowChange, RowKey, Values};
use crate::types::{DmsId, FileId, RowSetId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

/// Magic bytes identifying a base image file.
pub const BASE_MAGIC: [u8; 4] = *b"TBAS";

/// One entry of a base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRow {
    /// Row key.
    pub key: RowKey,
    /// Values at base time; `None` for a ghost.
    pub values: Option<Values>,
}

/// The base image of a disk row set.
#[derive(Debug)]
pub struct BaseData {
    file_id: FileId,
    rows: Vec<BaseRow>,
}

impl BaseData {
    /// Builds a base image from rows in key order.
    ///
    /// # Errors
    ///
    /// Returns an `OrderingViolation` if keys are not strictly ascending.
    pub fn new(file_id: FileId, rows: Vec<BaseRow>) -> TabletResult<Self> {
        if let Some(pair) = rows.windows(2).find(|w| w[0].key >= w[1].key) {
            return Err(TabletError::ordering(format!(
                "base image key {} follows {}",
                pair[1].key, pair[0].key
            )));
        }
        Ok(Self { file_id, rows })
    }

    /// Loads and verifies a base image file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, damaged or unsorted.
    pub fn open(path: &Path, file_id: FileId) -> TabletResult<Self> {
        let (_, rows) = read_data_file::<BaseRow>(path, BASE_MAGIC)?;
        Self::new(file_id, rows)
    }

    /// Writes the image to a new file and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or the write fails.
    pub fn write_to(&self, path: &Path) -> TabletResult<u64> {
        write_data_file(path, BASE_MAGIC, 0, &self.rows)
    }

    /// Returns the backing file id.
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Returns all entries in key order.
    #[must_use]
    pub fn rows(&self) -> &[BaseRow] {
        &self.rows
    }

    /// Returns the index of `key`.
    #[must_use]
    pub fn position(&self, key: &RowKey) -> Option<usize> {
        self.rows.binary_search_by(|r| r.key.cmp(key)).ok()
    }

    /// Returns the index of the first entry inside `lower`.
    #[must_use]
    pub fn lower_index(&self, lower: Bound<&RowKey>) -> usize {
        match lower {
            Bound::Unbounded => 0,
            Bound::Included(k) => self.rows.partition_point(|r| r.key < *k),
            Bound::Excluded(k) => self.rows.partition_point(|r| r.key <= *k),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the image has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The full version history of one key inside one row set.
///
/// `initial` is the state before the oldest retained change; each
/// transition is `(ts, state after every change at ts)`, strictly ascending
/// by timestamp, and no transition repeats the previous state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowHistory {
    /// State before every transition.
    pub initial: Option<Values>,
    /// Timestamped states, oldest first.
    pub transitions: Vec<(Timestamp, Option<Values>)>,
}

impl RowHistory {
    /// Returns the newest state.
    #[must_use]
    pub fn latest(&self) -> &Option<Values> {
        self.transitions
            .last()
            .map_or(&self.initial, |(_, state)| state)
    }

    /// Appends a transition, merging it with a same-timestamp predecessor
    /// and dropping it if nothing changed.
    pub fn push(&mut self, ts: Timestamp, state: Option<Values>) {
        if let Some((last_ts, _)) = self.transitions.last() {
            if *last_ts == ts {
                self.transitions.pop();
            }
        }
        if *self.latest() != state {
            self.transitions.push((ts, state));
        }
    }
}

/// An immutable row container with its delta history.
#[derive(Debug, Clone)]
pub struct DiskRowSet {
    id: RowSetId,
    created_ts: Timestamp,
    base: Arc<BaseData>,
    undo: Arc<DeltaStore>,
    redos: Vec<Arc<DeltaStore>>,
    frozen_dms: Option<Arc<DeltaMemStore>>,
    dms: Arc<DeltaMemStore>,
}

impl DiskRowSet {
    /// Assembles a row set from loaded or freshly written parts.
    ///
    /// # Errors
    ///
    /// Returns an error if a store has the wrong direction.
    pub fn new(
        id: RowSetId,
        created_ts: Timestamp,
        base: Arc<BaseData>,
        undo: Arc<DeltaStore>,
        redos: Vec<Arc<DeltaStore>>,
        dms: Arc<DeltaMemStore>,
    ) -> TabletResult<Self> {
        if undo.direction() != DeltaDirection::Undo
            || redos.iter().any(|s| s.direction() != DeltaDirection::Redo)
        {
            return Err(TabletError::corruption(format!(
                "{id} assembled with mismatched delta directions"
            )));
        }
        Ok(Self {
            id,
            created_ts,
            base,
            undo,
            redos,
            frozen_dms: None,
            dms,
        })
    }

    /// Opens a row set described by the manifest.
    ///
    /// Every file is checksummed and every delta store is re-checked for
    /// ordering on the way in.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or damaged, or the base image
    /// disagrees with the recorded key bounds.
    pub fn open(dir: &TabletDir, meta: &RowSetMeta) -> TabletResult<Self> {
        let base = BaseData::open(&dir.base_path(meta.id, meta.base_file), meta.base_file)?;
        let first = base.rows().first().map(|r| &r.key);
        let last = base.rows().last().map(|r| &r.key);
        if first != Some(&meta.min_key) || last != Some(&meta.max_key) {
            return Err(TabletError::corruption(format!(
                "{} base image bounds disagree with the manifest",
                meta.id
            )));
        }
        let undo = DeltaStore::open(
            &dir.delta_path(meta.id, meta.undo_file, DeltaDirection::Undo),
            meta.undo_file,
            DeltaDirection::Undo,
        )?;
        let redos = meta
            .redo_files
            .iter()
            .map(|file| {
                DeltaStore::open(
                    &dir.delta_path(meta.id, *file, DeltaDirection::Redo),
                    *file,
                    DeltaDirection::Redo,
                )
                .map(Arc::new)
            })
            .collect::<TabletResult<Vec<_>>>()?;
        Self::new(
            meta.id,
            meta.created_ts,
            Arc::new(base),
            Arc::new(undo),
            redos,
            Arc::new(DeltaMemStore::new(meta.durable_dms_below)),
        )
    }

    /// Returns the row set id.
    #[must_use]
    pub fn id(&self) -> RowSetId {
        self.id
    }

    /// Returns the timestamp the row set was built at.
    #[must_use]
    pub fn created_ts(&self) -> Timestamp {
        self.created_ts
    }

    /// Returns the base image.
    #[must_use]
    pub fn base(&self) -> &Arc<BaseData> {
        &self.base
    }

    /// Returns the UNDO store.
    #[must_use]
    pub fn undo(&self) -> &Arc<DeltaStore> {
        &self.undo
    }

    /// Returns the flushed REDO stores, oldest first.
    #[must_use]
    pub fn redos(&self) -> &[Arc<DeltaStore>] {
        &self.redos
    }

    /// Returns the active delta memory store.
    #[must_use]
    pub fn dms(&self) -> &Arc<DeltaMemStore> {
        &self.dms
    }

    /// Returns the DMS being flushed, if a delta flush is in progress.
    #[must_use]
    pub fn frozen_dms(&self) -> Option<&Arc<DeltaMemStore>> {
        self.frozen_dms.as_ref()
    }

    /// Returns the smallest base key.
    #[must_use]
    pub fn min_key(&self) -> Option<&RowKey> {
        self.base.rows().first().map(|r| &r.key)
    }

    /// Returns the largest base key.
    #[must_use]
    pub fn max_key(&self) -> Option<&RowKey> {
        self.base.rows().last().map(|r| &r.key)
    }

    /// Returns true if `key` falls inside this row set's key bounds.
    #[must_use]
    pub fn may_contain(&self, key: &RowKey) -> bool {
        match (self.min_key(), self.max_key()) {
            (Some(min), Some(max)) => min <= key && key <= max,
            _ => false,
        }
    }

    /// Returns the generation below which every DMS has been flushed.
    #[must_use]
    pub fn durable_dms_below(&self) -> DmsId {
        self.frozen_dms
            .as_ref()
            .map_or(self.dms.id(), |frozen| frozen.id())
    }

    /// Returns the number of records in flushed REDO stores.
    #[must_use]
    pub fn redo_record_count(&self) -> usize {
        self.redos.iter().map(|s| s.len()).sum()
    }

    /// Returns the number of mutations held in memory.
    #[must_use]
    pub fn memory_delta_count(&self) -> usize {
        self.dms.len() + self.frozen_dms.as_ref().map_or(0, |d| d.len())
    }

    /// Materializes `key` as of `ts`; `None` if absent or deleted.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the history does not replay.
    pub fn state_at(&self, key: &RowKey, ts: Timestamp) -> TabletResult<Option<Values>> {
        match self.base.position(key) {
            Some(index) => self.state_at_index(index, ts),
            None => Ok(None),
        }
    }

    /// Materializes the base entry at `index` as of `ts`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the history does not replay.
    pub fn state_at_index(&self, index: usize, ts: Timestamp) -> TabletResult<Option<Values>> {
        let entry = &self.base.rows()[index];
        let key = &entry.key;
        let mut state = entry.values.clone();
        for record in self.undo.records_for(key) {
            if record.ts <= ts {
                break;
            }
            record.change.apply(&mut state, key)?;
        }
        for store in &self.redos {
            for record in store.records_for(key) {
                if record.ts > ts {
                    break;
                }
                record.change.apply(&mut state, key)?;
            }
        }
        if let Some(frozen) = &self.frozen_dms {
            frozen.apply_up_to(key, ts, &mut state)?;
        }
        self.dms.apply_up_to(key, ts, &mut state)?;
        Ok(state)
    }

    /// Returns true if `key` is live after every applied mutation.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the history does not replay.
    pub fn is_live(&self, key: &RowKey) -> TabletResult<bool> {
        if !self.may_contain(key) {
            return Ok(false);
        }
        Ok(self.state_at(key, Timestamp::MAX)?.is_some())
    }

    /// Reconstructs the whole history of the base entry at `index`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the history does not replay.
    pub fn history_at_index(&self, index: usize) -> TabletResult<RowHistory> {
        let entry = &self.base.rows()[index];
        let key = &entry.key;

        // Walk UNDO newest first; the state before each group is the state
        // at that group's timestamp.
        let mut backwards = Vec::new();
        let mut state = entry.values.clone();
        let undo = self.undo.records_for(key);
        let mut i = 0;
        while i < undo.len() {
            let ts = undo[i].ts;
            backwards.push((ts, state.clone()));
            while i < undo.len() && undo[i].ts == ts {
                undo[i].change.apply(&mut state, key)?;
                i += 1;
            }
        }

        let mut history = RowHistory {
            initial: state,
            transitions: Vec::new(),
        };
        for (ts, state) in backwards.into_iter().rev() {
            history.push(ts, state);
        }

        let mut state = entry.values.clone();
        for (ts, change) in self.redo_changes(key) {
            change.apply(&mut state, key)?;
            history.push(ts, state.clone());
        }
        Ok(history)
    }

    /// Returns every REDO change of `key` across flushed stores and memory,
    /// oldest first.
    #[must_use]
    pub fn redo_changes(&self, key: &RowKey) -> Vec<(Timestamp, RowChange)> {
        let mut changes: Vec<(Timestamp, RowChange)> = self
            .redos
            .iter()
            .flat_map(|s| s.records_for(key))
            .map(|r| (r.ts, r.change.clone()))
            .collect();
        if let Some(frozen) = &self.frozen_dms {
            changes.extend(frozen.changes_for(key));
        }
        changes.extend(self.dms.changes_for(key));
        changes
    }

    /// Returns a copy that routes new mutations to a fresh DMS while the
    /// current one is flushed.
    ///
    /// # Errors
    ///
    /// Returns an invalid-operation error if a flush is already in progress.
    pub fn with_frozen_dms(&self) -> TabletResult<Self> {
        if self.frozen_dms.is_some() {
            return Err(TabletError::invalid_operation(format!(
                "{} already has a delta flush in progress",
                self.id
            )));
        }
        let mut next = self.clone();
        next.frozen_dms = Some(Arc::clone(&self.dms));
        next.dms = Arc::new(DeltaMemStore::new(self.dms.id().next()));
        Ok(next)
    }

    /// Returns a copy where the frozen DMS is replaced by its flushed store.
    #[must_use]
    pub fn with_flushed_dms(&self, store: Arc<DeltaStore>) -> Self {
        let mut next = self.clone();
        next.redos.push(store);
        next.frozen_dms = None;
        next
    }

    /// Returns a copy with a different REDO store list.
    #[must_use]
    pub fn with_redos(&self, redos: Vec<Arc<DeltaStore>>) -> Self {
        let mut next = self.clone();
        next.redos = redos;
        next
    }

    /// Returns a copy with a rewritten base image and UNDO store, keeping
    /// the DMS so concurrent mutations are not lost.
    #[must_use]
    pub fn with_rewritten_base(
        &self,
        created_ts: Timestamp,
        base: Arc<BaseData>,
        undo: Arc<DeltaStore>,
        redos: Vec<Arc<DeltaStore>>,
    ) -> Self {
        let mut next = self.clone();
        next.created_ts = created_ts;
        next.base = base;
        next.undo = undo;
        next.redos = redos;
        next
    }

    /// Describes the row set for the manifest.
    ///
    /// # Errors
    ///
    /// Returns an invalid-operation error for an empty row set.
    pub fn meta(&self) -> TabletResult<RowSetMeta> {
        let (min_key, max_key) = match (self.min_key(), self.max_key()) {
            (Some(min), Some(max)) => (min.clone(), max.clone()),
            _ => {
                return Err(TabletError::invalid_operation(format!(
                    "{} has an empty base image",
                    self.id
                )))
            }
        };
        Ok(RowSetMeta {
            id: self.id,
            created_ts: self.created_ts,
            min_key,
            max_key,
            base_file: self.base.file_id(),
            undo_file: self.undo.file_id(),
            redo_files: self.redos.iter().map(|s| s.file_id()).collect(),
            durable_dms_below: self.durable_dms_below(),
        })
    }
}

/// Orders row sets for stable display and compaction grouping.
#[must_use]
pub fn compare_by_min_key(a: &DiskRowSet, b: &DiskRowSet) -> Ordering {
    a.min_key().cmp(&b.min_key()).then(a.id().cmp(&b.id()))
}

/// Builds an UNDO record list for `key` from a history, newest first,
/// keeping only changes newer than `horizon`.
#[must_use]
pub fn undo_records_from_history(
    key: &RowKey,
    history: &RowHistory,
    horizon: Option<Timestamp>,
) -> Vec<DeltaRecord> {
    let mut records = Vec::new();
    let mut after = history.latest().clone();
    for (i, (ts, state)) in history.transitions.iter().enumerate().rev() {
        debug_assert_eq!(*state, after);
        let before = if i == 0 {
            &history.initial
        } else {
            &history.transitions[i - 1].1
        };
        if horizon.map_or(true, |h| *ts > h) {
            if let Some(change) = RowChange::between(state, before) {
                records.push(DeltaRecord::new(key.clone(), *ts, change));
            }
        }
        after = before.clone();
    }
    records
}
