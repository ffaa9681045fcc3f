//! Startup recovery.
//!
//! [`recover`] rebuilds a tablet's in-memory state from its directory:
//!
//! 1. load the manifest (or write the first one for a new tablet)
//! 2. delete files and row set directories the manifest does not list,
//!    left behind by an interrupted flush or compaction
//! 3. open every disk row set, verifying checksums and delta ordering
//! 4. stream the WAL and re-execute each operation whose target store is
//!    not yet durable, at its original timestamp
//! 5. rewrite the WAL to exactly those operations, which also cuts off a
//!    torn tail before anything new is appended
//! 6. resume the clock after the highest timestamp seen anywhere
//!
//! ## Durability of a logged operation
//!
//! | target          | durable when |
//! |-----------------|--------------|
//! | `Mrs(k)`        | `k` is below the manifest's `next_mrs_id`, except operations after the flush timestamp of the latest flush, which count as `Drs(rowset, dms:0)` |
//! | `Drs(r, d)`     | `r` is retired, or `d` is below `r`'s `durable_dms_below` |
//! | `NoEffect`      | always |

use crate::clock::MvccClock;
use crate::config::TabletConfig;
use crate::dir::TabletDir;
use crate::diskrowset::DiskRowSet;
use crate::error::{TabletError, TabletResult};
use crate::manifest::Manifest;
use crate::memrowset::MemRowSet;
use crate::mutation::{plan, Effect};
use crate::row::{RowOp, Schema};
use crate::rowset::{sort_rowsets, Components, RowSet};
use crate::tablet::insert_into;
use crate::types::{DmsId, Timestamp};
use crate::wal::{LoggedOp, OpTarget, WalBatch, WalWriter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// True if the tablet was created by this open.
    pub created: bool,
    /// Disk row sets opened.
    pub rowsets_opened: usize,
    /// Stray files and directories deleted.
    pub orphans_removed: usize,
    /// WAL batches read.
    pub batches_read: usize,
    /// Operations re-executed.
    pub ops_replayed: usize,
    /// Operations skipped because their effects were already durable.
    pub ops_skipped: usize,
    /// Batches left in the rewritten WAL.
    pub batches_retained: usize,
    /// Timestamp the clock resumed from.
    pub resumed_at: Timestamp,
}

/// A tablet's state as rebuilt from disk.
#[derive(Debug)]
pub struct RecoveredTablet {
    /// The locked tablet directory.
    pub dir: TabletDir,
    /// The committed manifest.
    pub manifest: Manifest,
    /// Disk row sets plus a mutable store holding the replayed operations.
    pub components: Components,
    /// The rewritten WAL, ready for appends.
    pub wal: WalWriter,
    /// The resumed clock.
    pub clock: MvccClock,
    /// What recovery did.
    pub report: RecoveryReport,
}

/// Rebuilds the tablet stored in `dir`.
///
/// `schema` is required to create a new tablet; for an existing one it must
/// match the stored schema if given.
///
/// # Errors
///
/// Returns `InvalidOperation` if there is no tablet and no schema,
/// `Validation` on a schema mismatch, `ChecksumMismatch` or
/// `WalCorruption` for a damaged log, and `Corruption` if a logged
/// operation does not replay against the stores it was logged against.
pub fn recover(
    dir: TabletDir,
    config: &TabletConfig,
    schema: Option<Schema>,
) -> TabletResult<RecoveredTablet> {
    let mut report = RecoveryReport::default();
    let mut manifest = match (dir.load_manifest()?, schema) {
        (Some(manifest), Some(schema)) if manifest.schema != schema => {
            return Err(TabletError::validation(format!(
                "tablet at {} has schema {:?}, not {:?}",
                dir.path().display(),
                manifest.schema,
                schema
            )));
        }
        (Some(manifest), _) => manifest,
        (None, Some(schema)) => {
            if dir.wal_path().exists() {
                return Err(TabletError::corruption(format!(
                    "{} has a WAL but no manifest",
                    dir.path().display()
                )));
            }
            let manifest = Manifest::new(schema);
            dir.save_manifest(&manifest)?;
            report.created = true;
            manifest
        }
        (None, None) => {
            return Err(TabletError::invalid_operation(format!(
                "no tablet at {}",
                dir.path().display()
            )));
        }
    };

    report.orphans_removed = dir.remove_orphans(&manifest)?;

    let mut rowsets = Vec::with_capacity(manifest.rowsets.len());
    for meta in &manifest.rowsets {
        rowsets.push(RowSet::Disk(Arc::new(DiskRowSet::open(&dir, meta)?)));
    }
    sort_rowsets(&mut rowsets);
    report.rowsets_opened = rowsets.len();
    let components = Components::new(Arc::new(MemRowSet::new(manifest.next_mrs_id)), rowsets);

    let mut wal = WalWriter::open(&dir.wal_path(), config.sync_on_commit)?;
    let mut retained: BTreeMap<Timestamp, WalBatch> = BTreeMap::new();
    let mut last_logged: Option<Timestamp> = None;
    for item in wal.iter()? {
        let (offset, batch) = item?;
        if let Some(previous) = last_logged {
            if batch.ts <= previous {
                return Err(TabletError::wal_corruption(format!(
                    "batch {} at offset {offset} does not follow {previous}",
                    batch.ts
                )));
            }
        }
        last_logged = Some(batch.ts);
        report.batches_read += 1;

        let mut ops = Vec::new();
        for logged in batch.ops {
            let Some(target) = resolve_target(&manifest, logged.target, batch.ts)? else {
                report.ops_skipped += 1;
                continue;
            };
            let target = replay_op(&manifest.schema, &components, &logged.op, target, batch.ts)
                .map_err(|err| {
                    TabletError::corruption(format!(
                        "replaying {} of {} at {}: {err}",
                        logged.op.kind(),
                        logged.op.key(),
                        batch.ts
                    ))
                })?;
            tracing::trace!(ts = %batch.ts, op = logged.op.kind(), "replayed");
            report.ops_replayed += 1;
            ops.push(LoggedOp {
                op: logged.op,
                target,
            });
        }
        if !ops.is_empty() {
            retained.insert(batch.ts, WalBatch { ts: batch.ts, ops });
        }
    }

    let resumed_at = last_logged.map_or(manifest.last_timestamp, |ts| {
        ts.max(manifest.last_timestamp)
    });
    if resumed_at > manifest.last_timestamp {
        // The rewrite may drop batches whose operations all failed; their
        // timestamps must still never be handed out again.
        manifest.last_timestamp = resumed_at;
        dir.save_manifest(&manifest)?;
    }
    report.batches_retained = wal.rewrite(|batch| Ok(retained.remove(&batch.ts)))?;
    if manifest.last_flush.take().is_some() {
        dir.save_manifest(&manifest)?;
    }
    report.resumed_at = resumed_at;
    let manifest_mark = manifest.ancient_history_mark;

    tracing::info!(
        path = %dir.path().display(),
        rowsets = report.rowsets_opened,
        replayed = report.ops_replayed,
        skipped = report.ops_skipped,
        resumed_at = %resumed_at,
        "tablet recovered"
    );
    Ok(RecoveredTablet {
        dir,
        manifest,
        components,
        wal,
        clock: MvccClock::resume_from(resumed_at, manifest_mark),
        report,
    })
}

/// Returns the store a logged operation's effect lives in if that store is
/// not yet durable, or `None` if the effect is already in a flushed file.
///
/// # Errors
///
/// Returns `WalCorruption` if the operation targets a row set the manifest
/// never handed out.
pub(crate) fn resolve_target(
    manifest: &Manifest,
    target: OpTarget,
    ts: Timestamp,
) -> TabletResult<Option<OpTarget>> {
    match target {
        OpTarget::NoEffect => Ok(None),
        OpTarget::Mrs(id) if id >= manifest.next_mrs_id => Ok(Some(target)),
        OpTarget::Mrs(id) => match manifest.last_flush {
            Some(flushed) if flushed.mrs_id == id && ts > flushed.flush_ts => resolve_target(
                manifest,
                OpTarget::Drs {
                    rowset: flushed.rowset,
                    dms: DmsId(0),
                },
                ts,
            ),
            _ => Ok(None),
        },
        OpTarget::Drs { rowset, dms } => match manifest.rowset(rowset) {
            Some(meta) => Ok((dms >= meta.durable_dms_below).then_some(target)),
            None if manifest.is_retired(rowset) => Ok(None),
            None => Err(TabletError::wal_corruption(format!(
                "log refers to unknown {rowset}"
            ))),
        },
    }
}

/// Drops the operations of `batch` that are durable and resolves the rest
/// to their current store. Returns `None` if nothing is left.
///
/// # Errors
///
/// Returns the errors of [`resolve_target`].
pub(crate) fn retain_non_durable(
    manifest: &Manifest,
    batch: WalBatch,
) -> TabletResult<Option<WalBatch>> {
    let mut ops = Vec::with_capacity(batch.ops.len());
    for logged in batch.ops {
        if let Some(target) = resolve_target(manifest, logged.target, batch.ts)? {
            ops.push(LoggedOp {
                op: logged.op,
                target,
            });
        }
    }
    Ok((!ops.is_empty()).then_some(WalBatch { ts: batch.ts, ops }))
}

/// Re-executes `op` against the store it was logged against.
fn replay_op(
    schema: &Schema,
    components: &Components,
    op: &RowOp,
    target: OpTarget,
    ts: Timestamp,
) -> TabletResult<OpTarget> {
    let key = op.key();
    match target {
        OpTarget::NoEffect => Ok(OpTarget::NoEffect),
        OpTarget::Mrs(_) => {
            let mrs = &components.mrs;
            let live = mrs.state_at(key, Timestamp::MAX)?;
            match plan(schema, op, live.as_ref())? {
                Effect::Insert(values) => insert_into(mrs, key, ts, values),
                Effect::Mutate(change) => {
                    mrs.mutate(key, ts, change)?;
                    Ok(OpTarget::Mrs(mrs.id()))
                }
                Effect::Nothing => Err(TabletError::corruption(
                    "operation logged against the mutable store has no effect",
                )),
            }
        }
        OpTarget::Drs { rowset, .. } => {
            let drs = components
                .disk_rowset(rowset)
                .ok_or_else(|| TabletError::corruption(format!("{rowset} is not open")))?;
            let live = drs.state_at(key, Timestamp::MAX)?;
            match plan(schema, op, live.as_ref())? {
                Effect::Mutate(change) => {
                    let dms = drs.dms();
                    dms.append(key.clone(), ts, change);
                    Ok(OpTarget::Drs {
                        rowset,
                        dms: dms.id(),
                    })
                }
                other => Err(TabletError::corruption(format!(
                    "operation logged against {rowset} replays as {other:?}"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FlushedMrs, RowSetMeta};
    use crate::row::{Row, RowKey, Value};
    use crate::scan::ScanSpec;
    use crate::tablet::Tablet;
    use crate::types::{FileId, MrsId, RowSetId};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    fn config() -> TabletConfig {
        TabletConfig::default().sync_on_commit(false)
    }

    fn row(k: i64, v: i64) -> Row {
        Row::new(
            RowKey::int(k),
            [("val".to_string(), Value::Int(v))].into_iter().collect(),
        )
    }

    fn update(k: i64, v: i64) -> RowOp {
        RowOp::Update {
            key: RowKey::int(k),
            values: [("val".to_string(), Value::Int(v))].into_iter().collect(),
        }
    }

    fn contents(tablet: &Tablet, ts: Option<Timestamp>) -> Vec<(i64, i64)> {
        let spec = ts.map_or_else(ScanSpec::new, |ts| ScanSpec::new().at(ts));
        tablet
            .scan(spec)
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

    fn meta(id: u64, durable_dms_below: u64) -> RowSetMeta {
        RowSetMeta {
            id: RowSetId(id),
            created_ts: Timestamp(1),
            min_key: RowKey::int(0),
            max_key: RowKey::int(9),
            base_file: FileId(1),
            undo_file: FileId(2),
            redo_files: Vec::new(),
            durable_dms_below: DmsId(durable_dms_below),
        }
    }

    #[test]
    fn durability_rules() {
        let mut manifest = Manifest::new(schema());
        manifest.next_rowset_id = 4;
        manifest.next_mrs_id = MrsId(3);
        manifest.apply_rowset_edit(&[], vec![meta(3, 2)]);
        manifest.last_flush = Some(FlushedMrs {
            mrs_id: MrsId(2),
            flush_ts: Timestamp(10),
            rowset: RowSetId(3),
        });
        let resolve = |target, ts| resolve_target(&manifest, target, Timestamp(ts)).unwrap();
        let drs = |r, d| OpTarget::Drs {
            rowset: RowSetId(r),
            dms: DmsId(d),
        };

        assert_eq!(resolve(OpTarget::Mrs(MrsId(3)), 12), Some(OpTarget::Mrs(MrsId(3))));
        assert_eq!(resolve(OpTarget::Mrs(MrsId(1)), 12), None);
        assert_eq!(resolve(OpTarget::Mrs(MrsId(2)), 10), None);
        // Moved into DMS 0 of rs:3, which has been flushed since.
        assert_eq!(resolve(OpTarget::Mrs(MrsId(2)), 11), None);
        assert_eq!(resolve(drs(3, 1), 12), None);
        assert_eq!(resolve(drs(3, 2), 12), Some(drs(3, 2)));
        assert_eq!(resolve(drs(2, 7), 12), None);
        assert_eq!(resolve(OpTarget::NoEffect, 12), None);
        assert!(resolve_target(&manifest, drs(9, 0), Timestamp(1)).is_err());

        manifest.rowsets[0].durable_dms_below = DmsId(0);
        assert_eq!(
            resolve_target(&manifest, OpTarget::Mrs(MrsId(2)), Timestamp(11)).unwrap(),
            Some(drs(3, 0))
        );
    }

    #[test]
    fn unflushed_writes_are_replayed() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        let t1 = tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        tablet.apply(RowOp::Insert(row(2, 2))).unwrap();
        tablet.apply(update(1, 10)).unwrap();
        let now = tablet.now();

        let tablet = tablet.restart().unwrap();
        let report = tablet.recovery_report().clone();
        assert_eq!(report.ops_replayed, 3);
        assert_eq!(report.ops_skipped, 0);
        assert_eq!(report.resumed_at, now);
        assert_eq!(contents(&tablet, Some(t1)), vec![(1, 1)]);
        assert_eq!(contents(&tablet, None), vec![(1, 10), (2, 2)]);
    }

    #[test]
    fn flushed_writes_are_not_replayed() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        tablet.flush().unwrap();
        tablet.apply(update(1, 2)).unwrap();

        let tablet = tablet.restart().unwrap();
        let report = tablet.recovery_report().clone();
        assert_eq!(report.rowsets_opened, 1);
        assert_eq!(report.ops_replayed, 1);
        assert_eq!(report.batches_retained, 1);
        assert_eq!(contents(&tablet, None), vec![(1, 2)]);

        tablet.flush_deltas().unwrap();
        let tablet = tablet.restart().unwrap();
        assert_eq!(tablet.recovery_report().ops_replayed, 0);
        assert_eq!(contents(&tablet, None), vec![(1, 2)]);
    }

    #[test]
    fn stale_log_after_flush_is_skipped() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        for k in 0..5 {
            tablet.apply(RowOp::Insert(row(k, k))).unwrap();
        }
        let stale = fs::read(&wal_path).unwrap();
        tablet.flush().unwrap();
        drop(tablet);

        // A crash between the manifest commit and the log rewrite.
        fs::write(&wal_path, stale).unwrap();
        let tablet = Tablet::open(dir.path(), config()).unwrap();
        assert_eq!(tablet.recovery_report().ops_skipped, 5);
        assert_eq!(tablet.recovery_report().ops_replayed, 0);
        assert_eq!(contents(&tablet, None).len(), 5);
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        drop(tablet);

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("wal.log"))
            .unwrap();
        file.write_all(b"TWAL\x01\x00\x01\xff\xff").unwrap();
        drop(file);

        let tablet = Tablet::open(dir.path(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(2, 2))).unwrap();
        let tablet = tablet.restart().unwrap();
        assert_eq!(contents(&tablet, None), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn damaged_log_record_is_fatal() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        tablet.apply(RowOp::Insert(row(2, 2))).unwrap();
        drop(tablet);

        let mut data = fs::read(&wal_path).unwrap();
        data[14] ^= 0xff;
        fs::write(&wal_path, data).unwrap();
        assert!(matches!(
            Tablet::open(dir.path(), config()),
            Err(TabletError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn orphaned_row_set_directories_are_removed() {
        let dir = tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), schema(), config()).unwrap();
        tablet.apply(RowOp::Insert(row(1, 1))).unwrap();
        drop(tablet);

        let orphan = dir.path().join("rowsets").join("rs-000042");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("base-000001.dat"), b"partial").unwrap();

        let tablet = Tablet::open(dir.path(), config()).unwrap();
        assert_eq!(tablet.recovery_report().orphans_removed, 1);
        assert!(!orphan.exists());
        assert_eq!(contents(&tablet, None), vec![(1, 1)]);
    }

    #[test]
    fn recover_reports_a_new_tablet() {
        let dir = tempdir().unwrap();
        let tablet_dir = TabletDir::open(dir.path(), true).unwrap();
        let recovered = recover(tablet_dir, &config(), Some(schema())).unwrap();
        assert!(recovered.report.created);
        assert_eq!(recovered.clock.now(), Timestamp::ZERO);
        assert_eq!(recovered.components.mrs.id(), MrsId(1));
        assert!(recovered.components.rowsets.is_empty());
    }
}
