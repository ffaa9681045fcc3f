//! Fuzz cases that once produced wrong reads, kept as regressions.

use tablet_testkit::prelude::*;
use TestOpKind::*;

fn run(ops: &[TestOp]) {
    run_fuzz_case(int_schema(), ops, 1).unwrap();
}

#[test]
fn reinsert_over_flushed_row_then_compact() {
    run(&[
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        // Delete lands in the DMS, the reinsert in a new MRS.
        op(Delete, 0),
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(CompactTablet, 0),
    ]);
}

#[test]
fn ghost_row_compacted_twice() {
    run(&[
        op(Insert, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Insert, 0),
        op(Delete, 0),
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(CompactTablet, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(CompactTablet, 0),
    ]);
}

#[test]
fn compaction_input_with_ghost_and_live_version() {
    run(&[
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Delete, 0),
        op(Insert, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(CompactTablet, 0),
    ]);
}

#[test]
fn repeated_delete_reinsert_cycles() {
    run(&[
        op(Insert, 0),
        op(FlushOps, 0),
        op(CompactTablet, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(CompactTablet, 0),
        op(Insert, 0),
        op(Update, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Delete, 0),
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Update, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Update, 0),
        op(Delete, 0),
        op(Insert, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(CompactTablet, 0),
    ]);
}

#[test]
fn scan_past_now_with_unwritten_insert() {
    run(&[
        op(UpsertPkOnly, 1),
        op(FlushOps, 0),
        op(Insert, 0),
        op(ScanAtTimestamp, 5),
    ]);
}

#[test]
fn update_survives_restarts_and_compaction() {
    run(&[
        op(Insert, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Update, 1),
        op(Restart, 0),
        op(FlushOps, 0),
        op(FlushDeltas, 0),
        op(Insert, 0),
        op(Delete, 1),
        op(Insert, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Restart, 0),
        op(MinorCompactDeltas, 0),
        op(CompactTablet, 0),
        op(Update, 1),
        op(FlushOps, 0),
    ]);
}

#[test]
fn undo_order_after_restarts() {
    run(&[
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Delete, 0),
        op(FlushOps, 0),
        op(FlushDeltas, 0),
        op(Restart, 0),
        op(Insert, 1),
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Delete, 0),
        op(Insert, 0),
        op(Update, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(FlushDeltas, 0),
        op(Restart, 0),
        op(Update, 1),
        op(Delete, 1),
        op(FlushOps, 0),
        op(Restart, 0),
        op(Insert, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Restart, 0),
        op(CompactTablet, 0),
    ]);
}

#[test]
fn upsert_sequence_replays() {
    run(&[
        op(Insert, 1),
        op(Upsert, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Upsert, 1),
        op(Delete, 1),
        op(Upsert, 1),
        op(Insert, 0),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Restart, 0),
        op(Update, 1),
    ]);
}

#[test]
fn pk_only_upsert_keeps_value_across_restart() {
    run(&[
        op(Insert, 1),
        op(FlushOps, 0),
        op(UpsertPkOnly, 1),
        op(FlushOps, 0),
        op(Restart, 0),
    ]);
}

#[test]
fn pk_only_schema_reinserts() {
    run_fuzz_case(
        pk_only_schema(),
        &[
            op(UpsertPkOnly, 1),
            op(Delete, 1),
            op(UpsertPkOnly, 1),
            op(UpsertPkOnly, 1),
            op(FlushOps, 0),
        ],
        1,
    )
    .unwrap();
}

#[test]
fn major_compaction_between_flushes() {
    run(&[
        op(Insert, 0),
        op(Insert, 1),
        op(FlushOps, 0),
        op(FlushTablet, 0),
        op(Update, 0),
        op(FlushOps, 0),
        op(FlushDeltas, 0),
        op(Delete, 1),
        op(FlushOps, 0),
        op(FlushDeltas, 0),
        op(MinorCompactDeltas, 0),
        op(Update, 0),
        op(FlushOps, 0),
        op(MajorCompactDeltas, 0),
        op(Restart, 0),
        op(Insert, 1),
        op(FlushOps, 0),
        op(ScanAtTimestamp, 2),
    ]);
}
