//! Delta and row-set compaction.
//!
//! - **Minor delta compaction** merges the REDO stores of one row set into
//!   a single store with the same records.
//! - **Major delta compaction** folds REDO records up to a timestamp into
//!   a new base image and turns what it folded into UNDO records.
//! - **Row-set compaction** merges every group of row sets whose key
//!   ranges overlap. Keys are merged k-way in key order; each key's
//!   histories from all inputs are merged by timestamp into one chain and
//!   rewritten as base image plus UNDO.
//!
//! ## Invariants
//!
//! - a compaction never changes the answer of a read at any timestamp at
//!   or above the ancient history mark
//! - every emitted delta sequence passes the ordering check before it is
//!   written; a violation poisons the tablet instead of being repaired
//! - outputs of a row-set compaction never overlap each other or any row
//!   set outside their group

use crate::delta::{DeltaDirection, DeltaMemStore, DeltaRecord, DeltaStore, OrderingChecker};
use crate::diskrowset::{
    compare_by_min_key, undo_records_from_history, BaseData, BaseRow, DiskRowSet, RowHistory,
};
use crate::error::{TabletError, TabletResult};
use crate::manifest::Manifest;
use crate::rowset::Components;
use crate::row::{RowChange, RowKey, Values};
use crate::tablet::{TabletShared, WriterState};
use crate::types::{DmsId, FileId, RowSetId, Timestamp};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

impl TabletShared {
    /// Handles an error raised before anything was installed: data errors
    /// poison the tablet, environment errors only abort the compaction.
    fn abort_compaction(&self, err: TabletError) -> TabletError {
        if err.is_corruption() {
            self.poison(err)
        } else {
            err
        }
    }

    pub(crate) fn minor_compact_deltas(&self) -> TabletResult<Option<RowSetId>> {
        let _maintenance = self.maintenance_lock.lock();
        self.check_poisoned()?;
        let min_stores = self.config.minor_compaction_min_stores.max(2);

        let (drs, file) = {
            let mut writer = self.writer.lock();
            let current = self.current();
            let Some(drs) = current
                .disk_rowsets()
                .filter(|drs| drs.redos().len() >= min_stores)
                .max_by_key(|drs| (drs.redos().len(), Reverse(drs.id())))
                .cloned()
            else {
                return Ok(None);
            };
            (drs, writer.manifest.allocate_file_id())
        };

        let id = drs.id();
        let inputs = drs.redos().to_vec();
        let store = merge_redo_stores(&inputs)
            .and_then(|records| self.write_delta_store(id, file, DeltaDirection::Redo, records))
            .and_then(|store| {
                self.dir.sync_rowset_dir(id)?;
                Ok(store)
            })
            .map_err(|err| self.abort_compaction(err))?;

        let mut writer = self.writer.lock();
        let obsolete = self
            .install_minor_compaction(&mut writer, id, &inputs, Arc::new(store))
            .map_err(|err| self.fail(err))?;
        drop(writer);
        self.remove_obsolete(&obsolete);

        self.metrics.record_minor_compaction();
        tracing::info!(rowset = %id, stores = inputs.len(), "minor delta compaction");
        Ok(Some(id))
    }

    fn install_minor_compaction(
        &self,
        writer: &mut WriterState,
        id: RowSetId,
        inputs: &[Arc<DeltaStore>],
        merged: Arc<DeltaStore>,
    ) -> TabletResult<Vec<PathBuf>> {
        let current = self.current();
        let drs = unchanged_rowset(&current, id, inputs)?;
        let next = Arc::new(drs.with_redos(vec![merged]));

        let mut manifest = writer.manifest.clone();
        manifest.apply_rowset_edit(&[], vec![next.meta()?]);
        self.commit_manifest(writer, manifest)?;
        self.install(current.with_disk_rowsets(&[], vec![next]));

        Ok(inputs
            .iter()
            .map(|s| self.dir.delta_path(id, s.file_id(), DeltaDirection::Redo))
            .collect())
    }

    pub(crate) fn major_compact_deltas(
        &self,
        up_to: Option<Timestamp>,
    ) -> TabletResult<Option<RowSetId>> {
        let _maintenance = self.maintenance_lock.lock();
        self.check_poisoned()?;
        let now = self.clock.now();
        let fold_ts = match up_to {
            Some(ts) if ts > now => {
                return Err(TabletError::invalid_operation(format!(
                    "cannot fold deltas up to {ts}, now is {now}"
                )));
            }
            Some(ts) => ts,
            None => now,
        };

        let (drs, files) = {
            let mut writer = self.writer.lock();
            let current = self.current();
            let Some(drs) = current
                .disk_rowsets()
                .filter(|drs| drs.redo_record_count() > 0)
                .max_by_key(|drs| (drs.redo_record_count(), Reverse(drs.id())))
                .cloned()
            else {
                return Ok(None);
            };
            let manifest = &mut writer.manifest;
            let files = [
                manifest.allocate_file_id(),
                manifest.allocate_file_id(),
                manifest.allocate_file_id(),
            ];
            (drs, files)
        };

        let id = drs.id();
        let horizon = self.clock.advance_ancient_mark(self.config.history_retention);
        let rewritten = fold_redo_history(&drs, fold_ts, horizon)
            .and_then(|folded| self.write_folded(id, files, folded))
            .map_err(|err| self.abort_compaction(err))?;

        let mut writer = self.writer.lock();
        let obsolete = self
            .install_major_compaction(&mut writer, &drs, fold_ts, rewritten)
            .map_err(|err| self.fail(err))?;
        drop(writer);
        self.remove_obsolete(&obsolete);

        self.metrics.record_major_compaction();
        tracing::info!(rowset = %id, fold_ts = %fold_ts, "major delta compaction");
        Ok(Some(id))
    }

    /// Writes the files of a folded row set; `None` if every row was
    /// dropped.
    fn write_folded(
        &self,
        id: RowSetId,
        [base_file, undo_file, redo_file]: [FileId; 3],
        folded: Folded,
    ) -> TabletResult<Option<(Arc<BaseData>, Arc<DeltaStore>, Vec<Arc<DeltaStore>>)>> {
        if folded.base.is_empty() {
            return Ok(None);
        }
        let base = BaseData::new(base_file, folded.base)?;
        base.write_to(&self.dir.base_path(id, base_file))?;
        let undo = self.write_delta_store(id, undo_file, DeltaDirection::Undo, folded.undo)?;
        let mut redos = Vec::new();
        if !folded.redo.is_empty() {
            let redo =
                self.write_delta_store(id, redo_file, DeltaDirection::Redo, folded.redo)?;
            redos.push(Arc::new(redo));
        }
        self.dir.sync_rowset_dir(id)?;
        Ok(Some((Arc::new(base), Arc::new(undo), redos)))
    }

    fn install_major_compaction(
        &self,
        writer: &mut WriterState,
        input: &DiskRowSet,
        fold_ts: Timestamp,
        rewritten: Option<(Arc<BaseData>, Arc<DeltaStore>, Vec<Arc<DeltaStore>>)>,
    ) -> TabletResult<Vec<PathBuf>> {
        let id = input.id();
        let current = self.current();
        let drs = unchanged_rowset(&current, id, input.redos())?;

        let mut obsolete = vec![self.dir.base_path(id, input.base().file_id())];
        obsolete.push(
            self.dir
                .delta_path(id, input.undo().file_id(), DeltaDirection::Undo),
        );
        obsolete.extend(
            input
                .redos()
                .iter()
                .map(|s| self.dir.delta_path(id, s.file_id(), DeltaDirection::Redo)),
        );

        let mut manifest = writer.manifest.clone();
        match rewritten {
            Some((base, undo, redos)) => {
                let created_ts = drs.created_ts().max(fold_ts);
                let next = Arc::new(drs.with_rewritten_base(created_ts, base, undo, redos));
                manifest.apply_rowset_edit(&[], vec![next.meta()?]);
                self.commit_manifest(writer, manifest)?;
                self.install(current.with_disk_rowsets(&[], vec![next]));
                Ok(obsolete)
            }
            None => {
                if drs.memory_delta_count() > 0 {
                    return Err(TabletError::corruption(format!(
                        "{id} has in-memory deltas but no live or historical rows"
                    )));
                }
                manifest.apply_rowset_edit(&[id], Vec::new());
                self.commit_manifest(writer, manifest)?;
                self.install(current.with_disk_rowsets(&[id], Vec::new()));
                self.rewrite_wal(writer)?;
                self.discard_rowset(id);
                Ok(Vec::new())
            }
        }
    }

    fn remove_obsolete(&self, paths: &[PathBuf]) {
        if let Err(err) = self.dir.remove_files(paths) {
            tracing::warn!(error = %err, "could not remove compacted files");
        }
    }

    pub(crate) fn compact_rowsets(&self) -> TabletResult<usize> {
        let _maintenance = self.maintenance_lock.lock();
        self.check_poisoned()?;
        let mut writer = self.writer.lock();

        let current = self.current();
        let groups = overlapping_groups(current.disk_rowsets().cloned().collect());
        if groups.is_empty() {
            return Ok(0);
        }
        let horizon = self.clock.advance_ancient_mark(self.config.history_retention);
        let compaction_ts = self.clock.now();

        let mut manifest = writer.manifest.clone();
        let mut written = Vec::new();
        let mut outputs = Vec::new();
        let mut retired = Vec::new();
        for group in &groups {
            let mut sink = OutputSink {
                shared: self,
                manifest: &mut manifest,
                written: &mut written,
                created_ts: compaction_ts,
                max_rows: self.config.max_rows_per_rowset.max(1),
                rows: Vec::new(),
                undo: Vec::new(),
                checker: OrderingChecker::new(DeltaDirection::Undo),
                outputs: Vec::new(),
            };
            let result = merge_group(group, horizon, &mut sink).and_then(|()| sink.finish());
            match result {
                Ok(built) => outputs.extend(built),
                Err(err) => {
                    for id in &written {
                        self.discard_rowset(*id);
                    }
                    return Err(self.abort_compaction(err));
                }
            }
            retired.extend(group.iter().map(|drs| drs.id()));
        }

        let install = || -> TabletResult<()> {
            let metas = outputs
                .iter()
                .map(|drs| drs.meta())
                .collect::<TabletResult<Vec<_>>>()?;
            manifest.apply_rowset_edit(&retired, metas);
            self.commit_manifest(&mut writer, manifest)?;
            self.install(current.with_disk_rowsets(&retired, outputs.clone()));
            self.rewrite_wal(&mut writer)
        };
        install().map_err(|err| self.fail(err))?;
        drop(writer);
        if let Err(err) = self.dir.remove_rowsets(&retired) {
            tracing::warn!(error = %err, "could not remove compacted row sets");
        }

        self.metrics.record_rowset_compaction();
        tracing::info!(
            groups = groups.len(),
            inputs = retired.len(),
            outputs = outputs.len(),
            "row set compaction"
        );
        Ok(retired.len())
    }
}

/// Returns the current version of row set `id`, checking that no one
/// replaced the REDO stores a compaction read.
fn unchanged_rowset(
    current: &Components,
    id: RowSetId,
    inputs: &[Arc<DeltaStore>],
) -> TabletResult<Arc<DiskRowSet>> {
    let drs = current
        .disk_rowset(id)
        .cloned()
        .ok_or_else(|| TabletError::corruption(format!("{id} vanished during compaction")))?;
    let same = drs.redos().len() == inputs.len()
        && drs
            .redos()
            .iter()
            .zip(inputs)
            .all(|(a, b)| Arc::ptr_eq(a, b));
    if !same {
        return Err(TabletError::corruption(format!(
            "{id} REDO stores changed during compaction"
        )));
    }
    Ok(drs)
}

/// Merges REDO stores of one row set, oldest store first, into one record
/// sequence in delta order.
///
/// # Errors
///
/// Returns an `OrderingViolation` if the stores' records for a key overlap
/// in time.
pub fn merge_redo_stores(stores: &[Arc<DeltaStore>]) -> TabletResult<Vec<DeltaRecord>> {
    let mut heap = BinaryHeap::new();
    let mut positions = vec![0usize; stores.len()];
    for (i, store) in stores.iter().enumerate() {
        if let Some(first) = store.records().first() {
            heap.push(Reverse((first.key.clone(), i)));
        }
    }

    let mut checker = OrderingChecker::new(DeltaDirection::Redo);
    let mut merged = Vec::with_capacity(stores.iter().map(|s| s.len()).sum());
    while let Some(Reverse((_, i))) = heap.pop() {
        let records = stores[i].records();
        let record = &records[positions[i]];
        checker.check_record(record)?;
        merged.push(record.clone());
        positions[i] += 1;
        if let Some(next) = records.get(positions[i]) {
            heap.push(Reverse((next.key.clone(), i)));
        }
    }
    Ok(merged)
}

/// A row set's contents after folding REDO history into the base image.
#[derive(Debug, Default)]
struct Folded {
    base: Vec<BaseRow>,
    undo: Vec<DeltaRecord>,
    redo: Vec<DeltaRecord>,
}

/// Applies every flushed REDO record at or below `fold_ts` to the base
/// image, recording what each one overwrote as UNDO. Rows with neither a
/// live state nor any history left are dropped.
fn fold_redo_history(
    drs: &DiskRowSet,
    fold_ts: Timestamp,
    horizon: Option<Timestamp>,
) -> TabletResult<Folded> {
    let mut folded = Folded::default();
    for entry in drs.base().rows() {
        let key = &entry.key;
        let mut state = entry.values.clone();
        let mut reverted = Vec::new();
        let mut remaining = Vec::new();
        for store in drs.redos() {
            for record in store.records_for(key) {
                if record.ts > fold_ts {
                    remaining.push(record.clone());
                    continue;
                }
                let before = state.clone();
                record.change.apply(&mut state, key)?;
                if let Some(change) = RowChange::between(&state, &before) {
                    reverted.push(DeltaRecord::new(key.clone(), record.ts, change));
                }
            }
        }

        let mut undo: Vec<DeltaRecord> = reverted.into_iter().rev().collect();
        undo.extend(drs.undo().records_for(key).iter().cloned());
        if let Some(horizon) = horizon {
            undo.retain(|r| r.ts > horizon);
        }

        let in_memory = drs.dms().contains(key)
            || drs.frozen_dms().is_some_and(|dms| dms.contains(key));
        if state.is_none() && undo.is_empty() && remaining.is_empty() && !in_memory {
            continue;
        }
        folded.base.push(BaseRow {
            key: key.clone(),
            values: state,
        });
        folded.undo.extend(undo);
        folded.redo.extend(remaining);
    }
    Ok(folded)
}

/// Groups row sets whose key ranges overlap, transitively. Only groups of
/// two or more are returned.
fn overlapping_groups(mut rowsets: Vec<Arc<DiskRowSet>>) -> Vec<Vec<Arc<DiskRowSet>>> {
    rowsets.sort_by(|a, b| compare_by_min_key(a, b));
    let mut groups = Vec::new();
    let mut group: Vec<Arc<DiskRowSet>> = Vec::new();
    let mut group_max: Option<RowKey> = None;
    for drs in rowsets {
        let (Some(min), Some(max)) = (drs.min_key().cloned(), drs.max_key().cloned()) else {
            continue;
        };
        let joins = group_max.as_ref().is_some_and(|end| min <= *end);
        if !joins {
            if group.len() >= 2 {
                groups.push(std::mem::take(&mut group));
            }
            group.clear();
            group_max = None;
        }
        group_max = Some(group_max.map_or(max.clone(), |end| end.max(max)));
        group.push(drs);
    }
    if group.len() >= 2 {
        groups.push(group);
    }
    groups
}

/// Returns the state a history shows at `ts`.
fn state_at<'a>(history: &'a RowHistory, ts: Timestamp) -> &'a Option<Values> {
    let after = history.transitions.partition_point(|(t, _)| *t <= ts);
    if after == 0 {
        &history.initial
    } else {
        &history.transitions[after - 1].1
    }
}

/// Returns the single live state among `states`, or `None`.
fn single_live<'a>(
    key: &RowKey,
    ts: Timestamp,
    states: impl Iterator<Item = &'a Option<Values>>,
) -> TabletResult<Option<Values>> {
    let mut live = states.filter_map(Option::as_ref);
    let first = live.next().cloned();
    if live.next().is_some() {
        return Err(TabletError::corruption(format!(
            "two live versions of {key} at {ts}"
        )));
    }
    Ok(first)
}

/// Merges the histories one key has in several row sets into one chain.
///
/// At every timestamp at most one input may hold a live version. With a
/// `horizon`, the chain starts from the merged state at the horizon and
/// only later transitions are kept.
///
/// # Errors
///
/// Returns a corruption error if two inputs are live at the same time.
pub fn merge_histories(
    key: &RowKey,
    histories: &[RowHistory],
    horizon: Option<Timestamp>,
) -> TabletResult<RowHistory> {
    let floor = horizon.unwrap_or(Timestamp::ZERO);
    let mut stamps: Vec<Timestamp> = histories
        .iter()
        .flat_map(|h| h.transitions.iter().map(|(ts, _)| *ts))
        .filter(|ts| *ts > floor)
        .collect();
    stamps.sort_unstable();
    stamps.dedup();

    let mut merged = RowHistory {
        initial: single_live(key, floor, histories.iter().map(|h| state_at(h, floor)))?,
        transitions: Vec::with_capacity(stamps.len()),
    };
    for ts in stamps {
        let state = single_live(key, ts, histories.iter().map(|h| state_at(h, ts)))?;
        merged.push(ts, state);
    }
    Ok(merged)
}

/// Walks a group of row sets in key order and feeds each key's merged
/// history to `sink`.
fn merge_group(
    group: &[Arc<DiskRowSet>],
    horizon: Option<Timestamp>,
    sink: &mut OutputSink<'_>,
) -> TabletResult<()> {
    let mut heap = BinaryHeap::new();
    let mut positions = vec![0usize; group.len()];
    for (i, drs) in group.iter().enumerate() {
        if let Some(first) = drs.base().rows().first() {
            heap.push(Reverse((first.key.clone(), i)));
        }
    }

    while let Some(Reverse((key, i))) = heap.pop() {
        let mut sources = vec![i];
        while let Some(Reverse((next, j))) = heap.peek() {
            if *next != key {
                break;
            }
            sources.push(*j);
            heap.pop();
        }

        let mut histories = Vec::with_capacity(sources.len());
        for i in sources {
            histories.push(group[i].history_at_index(positions[i])?);
            positions[i] += 1;
            if let Some(next) = group[i].base().rows().get(positions[i]) {
                heap.push(Reverse((next.key.clone(), i)));
            }
        }

        let merged = merge_histories(&key, &histories, horizon)?;
        let undo = undo_records_from_history(&key, &merged, horizon);
        let base = merged.latest().clone();
        if base.is_none() && undo.is_empty() {
            continue;
        }
        sink.push(key, base, undo)?;
    }
    Ok(())
}

/// Collects merged rows and cuts them into output row sets.
struct OutputSink<'a> {
    shared: &'a TabletShared,
    manifest: &'a mut Manifest,
    written: &'a mut Vec<RowSetId>,
    created_ts: Timestamp,
    max_rows: usize,
    rows: Vec<BaseRow>,
    undo: Vec<DeltaRecord>,
    checker: OrderingChecker,
    outputs: Vec<Arc<DiskRowSet>>,
}

impl OutputSink<'_> {
    fn push(
        &mut self,
        key: RowKey,
        values: Option<Values>,
        undo: Vec<DeltaRecord>,
    ) -> TabletResult<()> {
        for record in &undo {
            self.checker.check_record(record)?;
        }
        self.undo.extend(undo);
        self.rows.push(BaseRow { key, values });
        if self.rows.len() >= self.max_rows {
            self.cut()?;
        }
        Ok(())
    }

    fn cut(&mut self) -> TabletResult<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let id = self.manifest.allocate_rowset_id();
        let base_file = self.manifest.allocate_file_id();
        let undo_file = self.manifest.allocate_file_id();
        self.written.push(id);

        let dir = &self.shared.dir;
        dir.create_rowset_dir(id)?;
        let base = BaseData::new(base_file, std::mem::take(&mut self.rows))?;
        base.write_to(&dir.base_path(id, base_file))?;
        let undo = self.shared.write_delta_store(
            id,
            undo_file,
            DeltaDirection::Undo,
            std::mem::take(&mut self.undo),
        )?;
        dir.sync_rowset_dir(id)?;

        self.outputs.push(Arc::new(DiskRowSet::new(
            id,
            self.created_ts,
            Arc::new(base),
            Arc::new(undo),
            Vec::new(),
            Arc::new(DeltaMemStore::new(DmsId(0))),
        )?));
        Ok(())
    }

    fn finish(mut self) -> TabletResult<Vec<Arc<DiskRowSet>>> {
        self.cut()?;
        Ok(self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TabletConfig;
    use crate::row::{Row, RowOp, Schema, Value};
    use crate::scan::ScanSpec;
    use crate::tablet::{CompactionKind, Tablet};
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    fn config() -> TabletConfig {
        TabletConfig::default().sync_on_commit(false)
    }

    fn vals(v: i64) -> Values {
        [("val".to_string(), Value::Int(v))].into_iter().collect()
    }

    fn row(k: i64, v: i64) -> Row {
        Row::new(RowKey::int(k), vals(v))
    }

    fn update(k: i64, v: i64) -> RowOp {
        RowOp::Update {
            key: RowKey::int(k),
            values: vals(v),
        }
    }

    fn contents(tablet: &Tablet, ts: Timestamp) -> Vec<(i64, i64)> {
        tablet
            .scan(ScanSpec::new().at(ts))
            .unwrap()
            .map(|r| {
                let r = r.unwrap();
                (
                    r.key.0[0].as_int().unwrap(),
                    r.get("val").and_then(Value::as_int).unwrap(),
                )
            })
            .collect()
    }

    fn history(tablet: &Tablet) -> Vec<Vec<(i64, i64)>> {
        (0..=tablet.now().as_u64())
            .map(|ts| contents(tablet, Timestamp(ts)))
            .collect()
    }

    #[test]
    fn merge_histories_interleaves_by_timestamp() {
        let key = RowKey::int(1);
        let first = RowHistory {
            initial: None,
            transitions: vec![(Timestamp(1), Some(vals(5))), (Timestamp(3), None)],
        };
        let second = RowHistory {
            initial: None,
            transitions: vec![(Timestamp(4), Some(vals(7)))],
        };
        let merged = merge_histories(&key, &[second.clone(), first.clone()], None).unwrap();
        assert_eq!(
            merged.transitions,
            vec![
                (Timestamp(1), Some(vals(5))),
                (Timestamp(3), None),
                (Timestamp(4), Some(vals(7))),
            ]
        );

        let trimmed = merge_histories(&key, &[first, second], Some(Timestamp(3))).unwrap();
        assert_eq!(trimmed.initial, None);
        assert_eq!(trimmed.transitions, vec![(Timestamp(4), Some(vals(7)))]);
    }

    #[test]
    fn merge_histories_rejects_overlapping_lives() {
        let key = RowKey::int(1);
        let a = RowHistory {
            initial: None,
            transitions: vec![(Timestamp(1), Some(vals(5)))],
        };
        let b = RowHistory {
            initial: None,
            transitions: vec![(Timestamp(2), Some(vals(6)))],
        };
        assert!(matches!(
            merge_histories(&key, &[a, b], None),
            Err(TabletError::Corruption { .. })
        ));
    }

    #[test]
    fn merge_redo_stores_orders_across_stores() {
        let store = |file, records: Vec<(i64, u64)>| {
            Arc::new(
                DeltaStore::new(
                    FileId(file),
                    DeltaDirection::Redo,
                    records
                        .into_iter()
                        .map(|(k, ts)| {
                            DeltaRecord::new(RowKey::int(k), Timestamp(ts), RowChange::Delete)
                        })
                        .collect(),
                )
                .unwrap(),
            )
        };
        let old = store(1, vec![(1, 2), (3, 2)]);
        let new = store(2, vec![(1, 5), (2, 5), (3, 6)]);
        let merged = merge_redo_stores(&[old.clone(), new.clone()]).unwrap();
        let order: Vec<(i64, u64)> = merged
            .iter()
            .map(|r| (r.key.0[0].as_int().unwrap(), r.ts.as_u64()))
            .collect();
        assert_eq!(order, vec![(1, 2), (1, 5), (2, 5), (3, 2), (3, 6)]);

        assert!(matches!(
            merge_redo_stores(&[new, old]),
            Err(TabletError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn minor_compaction_merges_redo_stores() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        for k in 0..5 {
            tablet.apply(RowOp::Insert(row(k, 0))).unwrap();
        }
        tablet.flush().unwrap();
        assert_eq!(tablet.compact_deltas(CompactionKind::Minor).unwrap(), None);

        for round in 1..=3 {
            for k in 0..5 {
                tablet.apply(update(k, round)).unwrap();
            }
            tablet.flush_deltas().unwrap();
        }
        let before = history(&tablet);
        assert_eq!(tablet.stats().unwrap().rowsets[0].redo_stores, 3);

        let id = tablet.compact_deltas(CompactionKind::Minor).unwrap();
        assert!(id.is_some());
        let stats = tablet.stats().unwrap();
        assert_eq!(stats.rowsets[0].redo_stores, 1);
        assert_eq!(stats.rowsets[0].redo_records, 15);
        assert_eq!(history(&tablet), before);

        let tablet = tablet.restart().unwrap();
        assert_eq!(history(&tablet), before);
    }

    #[test]
    fn major_compaction_folds_into_base() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        for k in 0..5 {
            tablet.apply(RowOp::Insert(row(k, 0))).unwrap();
        }
        tablet.flush().unwrap();
        tablet.apply(update(1, 10)).unwrap();
        tablet.apply(RowOp::Delete(RowKey::int(2))).unwrap();
        let middle = tablet.now();
        tablet.apply(update(1, 11)).unwrap();
        tablet.flush_deltas().unwrap();
        tablet.apply(update(3, 30)).unwrap();
        let before = history(&tablet);

        assert!(matches!(
            tablet.major_compact_deltas_up_to(Timestamp(1_000)),
            Err(TabletError::InvalidOperation { .. })
        ));
        tablet.major_compact_deltas_up_to(middle).unwrap().unwrap();
        assert_eq!(tablet.stats().unwrap().rowsets[0].redo_records, 1);
        assert_eq!(history(&tablet), before);

        tablet.compact_deltas(CompactionKind::Major).unwrap().unwrap();
        let stats = tablet.stats().unwrap();
        assert_eq!(stats.rowsets[0].redo_records, 0);
        assert_eq!(stats.rowsets[0].ghost_rows, 1);
        assert_eq!(stats.rowsets[0].dms_records, 1);
        assert_eq!(history(&tablet), before);
        assert_eq!(tablet.compact_deltas(CompactionKind::Major).unwrap(), None);

        let tablet = tablet.restart().unwrap();
        assert_eq!(history(&tablet), before);
    }

    #[test]
    fn rowset_compaction_merges_overlapping_sets() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        for k in (0..10).step_by(2) {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        tablet.flush().unwrap();
        for k in (1..10).step_by(2) {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        tablet.flush().unwrap();
        for k in 100..103 {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        let separate = tablet.flush().unwrap().unwrap();
        tablet.apply(update(4, 40)).unwrap();
        tablet.apply(RowOp::Delete(RowKey::int(5))).unwrap();
        let before = history(&tablet);

        assert_eq!(tablet.compact().unwrap(), 2);
        let stats = tablet.stats().unwrap();
        assert_eq!(stats.rowsets.len(), 2);
        assert!(stats.rowsets.iter().any(|r| r.id == separate));
        assert_eq!(stats.dms_records(), 0);
        assert_eq!(history(&tablet), before);
        assert_eq!(tablet.compact().unwrap(), 0);

        let tablet = tablet.restart().unwrap();
        assert_eq!(history(&tablet), before);
    }

    #[test]
    fn rowset_compaction_splits_outputs() {
        let dir = tempdir().unwrap();
        let tablet =
            Tablet::create(dir.path(), schema(), config().max_rows_per_rowset(4)).unwrap();
        for k in (0..10).step_by(2) {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        tablet.flush().unwrap();
        for k in (1..10).step_by(2) {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        tablet.flush().unwrap();
        let before = history(&tablet);

        tablet.compact().unwrap();
        let stats = tablet.stats().unwrap();
        let sizes: Vec<usize> = stats.rowsets.iter().map(|r| r.base_rows).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        for pair in stats.rowsets.windows(2) {
            assert!(pair[0].max_key < pair[1].min_key);
        }
        assert_eq!(history(&tablet), before);
    }

    #[test]
    fn delete_and_reinsert_across_row_sets() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(1, 5))).unwrap();
        tablet.flush().unwrap();
        let after_first_flush = tablet.now();
        assert_eq!(tablet.compact().unwrap(), 0);
        tablet.apply(RowOp::Delete(RowKey::int(1))).unwrap();
        tablet.apply(RowOp::Insert(row(1, 7))).unwrap();
        tablet.flush().unwrap();
        let after_second_flush = tablet.now();
        assert_eq!(tablet.compact().unwrap(), 2);

        assert_eq!(contents(&tablet, after_first_flush), vec![(1, 5)]);
        assert_eq!(contents(&tablet, after_second_flush), vec![(1, 7)]);
        assert_eq!(contents(&tablet, tablet.now()), vec![(1, 7)]);
        assert_eq!(tablet.stats().unwrap().rowsets.len(), 1);
    }

    #[test]
    fn retention_discards_old_history() {
        let dir = tempdir().unwrap();
        let tablet =
            Tablet::create(dir.path(), schema(), config().history_retention(Some(2))).unwrap();
        tablet.apply(RowOp::Insert(row(1, 0))).unwrap();
        tablet.flush().unwrap();
        for v in 1..=6 {
            tablet.apply(update(1, v)).unwrap();
        }
        tablet.flush_deltas().unwrap();
        let pinned = tablet.scan(ScanSpec::new().at(Timestamp(3))).unwrap();

        tablet.compact_deltas(CompactionKind::Major).unwrap();
        assert_eq!(tablet.ancient_history_mark(), Timestamp(3));
        assert_eq!(contents(&tablet, Timestamp(3)), vec![(1, 2)]);
        let rows: Vec<_> = pinned.map(Result::unwrap).collect();
        assert_eq!(rows[0].get("val"), Some(&Value::Int(2)));

        tablet.apply(update(1, 7)).unwrap();
        tablet.flush_deltas().unwrap();
        tablet.compact_deltas(CompactionKind::Major).unwrap();
        let now = tablet.now();
        assert_eq!(tablet.ancient_history_mark(), Timestamp(now.as_u64() - 2));
        assert!(matches!(
            tablet.scan(ScanSpec::new().at(Timestamp(3))),
            Err(TabletError::SnapshotTooOld { .. })
        ));
        assert_eq!(contents(&tablet, now), vec![(1, 7)]);
        assert_eq!(
            contents(&tablet, Timestamp(now.as_u64() - 2)),
            vec![(1, 5)]
        );
    }

    #[test]
    fn ancient_mark_survives_restart() {
        let dir = tempdir().unwrap();
        let tablet =
            Tablet::create(dir.path(), schema(), config().history_retention(Some(2))).unwrap();
        tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        tablet.flush().unwrap();
        for v in 2..=7 {
            tablet.apply(update(1, v)).unwrap();
        }
        tablet.flush_deltas().unwrap();
        tablet.compact_deltas(CompactionKind::Major).unwrap();
        let mark = tablet.ancient_history_mark();
        assert_eq!(mark, Timestamp(5));

        let tablet = tablet.restart().unwrap();
        assert_eq!(tablet.ancient_history_mark(), mark);
        assert!(matches!(
            tablet.scan(ScanSpec::new().at(Timestamp(2))),
            Err(TabletError::SnapshotTooOld { .. })
        ));
        assert_eq!(contents(&tablet, mark), vec![(1, 5)]);
        assert_eq!(contents(&tablet, tablet.now()), vec![(1, 7)]);
    }
}
