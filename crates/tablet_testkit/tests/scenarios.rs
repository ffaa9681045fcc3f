//! End-to-end scenarios across flushes, compactions and restarts.

use tablet_core::{CompactionKind, RowKey, RowOp, ScanSpec, TabletError, Timestamp};
use tablet_testkit::prelude::*;

fn rows(tablet: &TestTablet, ts: Option<Timestamp>) -> Vec<(i64, Option<i64>)> {
    let mut spec = ScanSpec::new();
    if let Some(ts) = ts {
        spec = spec.at(ts);
    }
    tablet
        .scan(spec)
        .unwrap()
        .map(|row| decode_int_row(&row.unwrap()))
        .collect()
}

fn update(key: i64, val: i64) -> RowOp {
    RowOp::Update {
        key: RowKey::int(key),
        values: int_values(Some(val)),
    }
}

#[test]
fn delete_and_reinsert_across_rowsets() {
    with_temp_tablet(|t| {
        let first = t.apply(RowOp::Insert(int_row(1, Some(10)))).unwrap();
        t.flush().unwrap();
        assert_eq!(t.compact().unwrap(), 0);
        let deleted = t.apply(RowOp::Delete(RowKey::int(1))).unwrap();
        let reinserted = t.apply(RowOp::Insert(int_row(1, Some(20)))).unwrap();
        t.flush().unwrap();

        assert_eq!(rows(t, Some(first)), vec![(1, Some(10))]);
        assert!(rows(t, Some(deleted)).is_empty());
        assert_eq!(rows(t, Some(reinserted)), vec![(1, Some(20))]);

        assert_eq!(t.compact().unwrap(), 2);
        t.restart().unwrap();
        assert_eq!(rows(t, Some(first)), vec![(1, Some(10))]);
        assert!(rows(t, Some(deleted)).is_empty());
        assert_eq!(rows(t, None), vec![(1, Some(20))]);
        assert_eq!(t.verify().unwrap(), 1);
    });
}

#[test]
fn pk_only_upsert_leaves_live_row_alone() {
    with_temp_tablet(|t| {
        t.apply(RowOp::Insert(int_row(1, Some(5)))).unwrap();
        t.flush().unwrap();
        let outcome = t
            .write(vec![
                RowOp::UpsertPkOnly(RowKey::int(1)),
                RowOp::UpsertPkOnly(RowKey::int(2)),
            ])
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(rows(t, None), vec![(1, Some(5)), (2, None)]);

        t.restart().unwrap();
        assert_eq!(rows(t, None), vec![(1, Some(5)), (2, None)]);
    });
}

#[test]
fn long_redo_chain_folds_into_base() {
    with_temp_tablet(|t| {
        t.apply(RowOp::Insert(int_row(7, Some(0)))).unwrap();
        t.flush().unwrap();

        let batch: Vec<RowOp> = (1..=500).map(|v| update(7, v)).collect();
        let outcome = t.write(batch).unwrap();
        assert!(outcome.is_success());
        t.flush_deltas().unwrap();

        let stats = t.stats().unwrap();
        assert_eq!(stats.rowsets.len(), 1);
        assert_eq!(stats.rowsets[0].redo_records, 500);
        assert_eq!(rows(t, None), vec![(7, Some(500))]);

        t.compact_deltas(CompactionKind::Major).unwrap();
        let stats = t.stats().unwrap();
        assert_eq!(stats.rowsets[0].redo_records, 0);
        assert_eq!(rows(t, None), vec![(7, Some(500))]);
        assert_eq!(rows(t, Some(Timestamp(outcome.timestamp.0 - 1))), vec![(7, Some(0))]);

        t.restart().unwrap();
        assert_eq!(rows(t, None), vec![(7, Some(500))]);
    });
}

#[test]
fn failed_ops_do_not_block_the_batch() {
    with_temp_tablet(|t| {
        t.apply(RowOp::Insert(int_row(1, None))).unwrap();
        let outcome = t
            .write(vec![
                RowOp::Insert(int_row(1, Some(3))),
                RowOp::Insert(int_row(2, Some(4))),
                RowOp::Delete(RowKey::int(9)),
            ])
            .unwrap();
        assert!(!outcome.is_success());
        assert!(outcome.results[0].is_err());
        assert!(outcome.results[1].is_ok());
        assert!(outcome.results[2].is_err());
        assert_eq!(rows(t, None), vec![(1, None), (2, Some(4))]);
    });
}

#[test]
fn retention_limits_old_snapshots() {
    let config = test_config().history_retention(Some(2));
    let mut t = TestTablet::create(int_schema(), config).unwrap();
    let first = t.apply(RowOp::Insert(int_row(1, Some(1)))).unwrap();
    t.flush().unwrap();
    for v in 2..=6 {
        t.apply(update(1, v)).unwrap();
    }
    t.flush_deltas().unwrap();
    t.compact_deltas(CompactionKind::Major).unwrap();

    let mark = t.ancient_history_mark();
    assert!(mark > first);
    assert!(matches!(
        t.scan(ScanSpec::new().at(first)),
        Err(TabletError::SnapshotTooOld { .. })
    ));
    assert_eq!(rows(&t, None), vec![(1, Some(6))]);

    t.restart().unwrap();
    assert_eq!(t.ancient_history_mark(), mark);
    assert!(matches!(
        t.scan(ScanSpec::new().at(first)),
        Err(TabletError::SnapshotTooOld { .. })
    ));
    assert_eq!(rows(&t, Some(mark)), vec![(1, Some(4))]);
    assert_eq!(rows(&t, None), vec![(1, Some(6))]);
}

#[test]
fn recovery_after_crashes() {
    let batches: Vec<Vec<RowOp>> = (0..8)
        .map(|i| vec![RowOp::Upsert(int_row(i % 4, Some(i)))])
        .collect();
    for point in [
        CrashPoint::TornWalTail { bytes: 1 },
        CrashPoint::OrphanRowSet,
        CrashPoint::LeftoverTempFiles,
    ] {
        let outcome = run_crash_scenario(&batches, 3, point).unwrap();
        assert!(outcome.batches_lost <= 1, "{point:?}: {outcome:?}");
        assert_eq!(outcome.rows.len(), 4);
    }
}

#[test]
fn corrupt_manifest_is_reported() {
    let mut t = TestTablet::int();
    t.apply(RowOp::Insert(int_row(1, Some(1)))).unwrap();
    t.flush().unwrap();
    let err = t
        .while_closed(|dir| flip_byte(&dir.join("MANIFEST"), 12))
        .unwrap_err();
    assert!(err.is_corruption(), "{err}");
}
